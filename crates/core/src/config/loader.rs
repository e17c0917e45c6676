//! Settings loading and component wiring.
//!
//! Resolution order:
//! 1. `SCANNER_CONFIG` names a TOML file, which is loaded as-is
//! 2. otherwise `SCANNER_PROFILE` selects a preset
//! 3. otherwise the default profile
//!
//! `${VAR}` references in the RPC URL and venue base URLs are expanded from
//! the environment afterwards.

use anyhow::{bail, Context, Result};
use scanner_api::{QuoteAggregator, SwapVenue, VenueFactory};
use scanner_chain::{ChainReader, ProtocolFactory};
use std::sync::Arc;
use tracing::{debug, info};

use super::settings::ScannerSettings;
use crate::events::EventSink;
use crate::scanner::{ProtocolRegistration, ScanOrchestrator};

pub const CONFIG_ENV: &str = "SCANNER_CONFIG";
pub const PROFILE_ENV: &str = "SCANNER_PROFILE";

/// Expand `${VAR_NAME}` patterns with environment variable values.
///
/// Unset variables are left in place.
pub fn expand_env(s: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")?;
    let mut result = s.to_string();

    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            if let Ok(value) = std::env::var(var_match.as_str()) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }

    Ok(result)
}

fn has_placeholder(s: &str) -> bool {
    s.contains("${")
}

/// Load settings from the environment (see module docs).
pub fn load_settings() -> Result<ScannerSettings> {
    let settings = match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            info!(path = %path, "Loading scanner config file");
            ScannerSettings::from_file(&path)?
        }
        Err(_) => {
            let profile = std::env::var(PROFILE_ENV).unwrap_or_else(|_| "default".to_string());
            ScannerSettings::profile(&profile).with_context(|| {
                format!("Unknown {} '{}' (expected default, testing or production)", PROFILE_ENV, profile)
            })?
        }
    };
    resolve(settings)
}

/// Expand environment references and validate.
pub fn resolve(mut settings: ScannerSettings) -> Result<ScannerSettings> {
    settings.rpc.url = expand_env(&settings.rpc.url)?;
    for venue in &mut settings.venues {
        if let Some(url) = venue.base_url.as_mut() {
            *url = expand_env(url)?;
        }
    }
    settings.validate()?;
    Ok(settings)
}

/// The RPC URL, failing if an environment reference is still unresolved.
pub fn rpc_url(settings: &ScannerSettings) -> Result<&str> {
    let url = settings.rpc.url.trim();
    if url.is_empty() || has_placeholder(url) {
        bail!("RPC URL '{}' is not set; export the referenced variable", url);
    }
    Ok(url)
}

/// Build every enabled protocol adapter and every venue, and wire them into
/// an orchestrator.
pub fn build_orchestrator(
    settings: &ScannerSettings,
    reader: Arc<dyn ChainReader>,
    events: Arc<dyn EventSink>,
) -> Result<ScanOrchestrator> {
    let protocols = ProtocolFactory::new(reader.clone()).with_options(settings.rpc.read_options());
    let venues = VenueFactory::new(reader);

    let built = settings
        .venues
        .iter()
        .map(|spec| venues.build(spec))
        .collect::<Result<Vec<Arc<dyn SwapVenue>>>>()?;
    let mut orchestrator = ScanOrchestrator::new(QuoteAggregator::new(built), events);

    for entry in &settings.protocols {
        if !entry.enabled {
            debug!(protocol = %entry.spec.id, "Protocol disabled, skipping");
            continue;
        }
        let adapter = protocols.build(&entry.spec)?;
        let registration = ProtocolRegistration::new(adapter)
            .with_strategy(entry.discovery)
            .with_watch_list(entry.watch_list_addresses()?);
        orchestrator.register(registration)?;
    }

    info!(
        protocols = orchestrator.protocol_ids().count(),
        venues = orchestrator.venue_ids().len(),
        "Scan orchestrator ready"
    );
    Ok(orchestrator)
}
