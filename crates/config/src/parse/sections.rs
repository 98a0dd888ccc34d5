//! Per-block KDL parsing.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::trace;

use pqcert_common::Algorithm;

use crate::*;

use super::{get_string_entry, get_string_list, get_u64_entry};

fn to_u32(value: u64, name: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("'{}' is out of range: {}", name, value))
}

/// Parse the storage block
pub fn parse_storage(node: &::kdl::KdlNode) -> Result<StorageConfig> {
    trace!("Parsing storage configuration block");
    Ok(StorageConfig {
        data_dir: get_string_entry(node, "data-dir")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir),
    })
}

/// Parse the challenge block
pub fn parse_challenge(node: &::kdl::KdlNode) -> Result<ChallengeConfig> {
    trace!("Parsing challenge configuration block");
    let mut path_prefix =
        get_string_entry(node, "path-prefix").unwrap_or_else(default_path_prefix);
    if !path_prefix.ends_with('/') {
        path_prefix.push('/');
    }

    Ok(ChallengeConfig {
        ttl_secs: get_u64_entry(node, "ttl-secs")?.unwrap_or_else(default_challenge_ttl),
        path_prefix,
    })
}

/// Parse the validator block
pub fn parse_validator(node: &::kdl::KdlNode) -> Result<ValidatorConfig> {
    trace!("Parsing validator configuration block");
    Ok(ValidatorConfig {
        timeout_secs: get_u64_entry(node, "timeout-secs")?
            .unwrap_or_else(default_validator_timeout),
        max_body_bytes: get_u64_entry(node, "max-body-bytes")?
            .map(|v| v as usize)
            .unwrap_or_else(default_max_body_bytes),
    })
}

/// Parse the issuance block
pub fn parse_issuance(node: &::kdl::KdlNode) -> Result<IssuanceConfig> {
    trace!("Parsing issuance configuration block");
    let default_algorithm = match get_string_entry(node, "default-algorithm") {
        Some(name) => name.parse::<Algorithm>()?,
        None => Algorithm::default(),
    };

    let validity_days = match get_u64_entry(node, "validity-days")? {
        Some(v) => to_u32(v, "validity-days")?,
        None => default_validity_days(),
    };

    Ok(IssuanceConfig {
        validity_days,
        default_algorithm,
    })
}

/// Parse the local-ca block
pub fn parse_local_ca(node: &::kdl::KdlNode) -> Result<LocalCaConfig> {
    trace!("Parsing local-ca configuration block");
    let defaults = LocalCaConfig::default();

    let root_validity_days = match get_u64_entry(node, "root-validity-days")? {
        Some(v) => to_u32(v, "root-validity-days")?,
        None => defaults.root_validity_days,
    };
    let leaf_validity_days = match get_u64_entry(node, "leaf-validity-days")? {
        Some(v) => to_u32(v, "leaf-validity-days")?,
        None => defaults.leaf_validity_days,
    };

    let config = LocalCaConfig {
        base_dir: get_string_entry(node, "base-dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.base_dir),
        common_name: get_string_entry(node, "common-name").unwrap_or(defaults.common_name),
        organization: get_string_entry(node, "organization").unwrap_or(defaults.organization),
        organizational_unit: get_string_entry(node, "organizational-unit")
            .unwrap_or(defaults.organizational_unit),
        country: get_string_entry(node, "country").unwrap_or(defaults.country),
        root_validity_days,
        leaf_validity_days,
        pfx_password: get_string_entry(node, "pfx-password").unwrap_or(defaults.pfx_password),
        aliases: get_string_list(node, "aliases").unwrap_or(defaults.aliases),
    };

    trace!(
        base_dir = %config.base_dir.display(),
        aliases = config.aliases.len(),
        "Parsed local-ca configuration"
    );

    Ok(config)
}

/// Parse the renewal block
pub fn parse_renewal(node: &::kdl::KdlNode) -> Result<RenewalConfig> {
    trace!("Parsing renewal configuration block");
    let threshold_days = match get_u64_entry(node, "threshold-days")? {
        Some(v) => to_u32(v, "threshold-days")?,
        None => default_threshold_days(),
    };

    Ok(RenewalConfig {
        threshold_days,
        check_interval_secs: get_u64_entry(node, "check-interval-secs")?
            .unwrap_or_else(default_check_interval),
    })
}

/// Parse the trust block
pub fn parse_trust(node: &::kdl::KdlNode) -> Result<TrustConfig> {
    trace!("Parsing trust configuration block");
    let elevation = match get_string_entry(node, "elevate").as_deref() {
        None | Some("sudo") => Elevation::Sudo,
        Some("none") => Elevation::None,
        Some(other) => {
            return Err(anyhow!(
                "Invalid elevate value '{}'. Valid values: sudo, none",
                other
            ));
        }
    };

    Ok(TrustConfig { elevation })
}

/// Parse the client block
pub fn parse_client(node: &::kdl::KdlNode) -> Result<ClientConfig> {
    trace!("Parsing client configuration block");
    let server_url = get_string_entry(node, "server-url")
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(default_server_url);

    Ok(ClientConfig {
        server_url,
        webroot: get_string_entry(node, "webroot")
            .map(PathBuf::from)
            .unwrap_or_else(default_webroot),
        certs_dir: get_string_entry(node, "certs-dir")
            .map(PathBuf::from)
            .unwrap_or_else(default_domains_dir),
        timeout_secs: get_u64_entry(node, "timeout-secs")?.unwrap_or_else(default_client_timeout),
        publish_delay_secs: get_u64_entry(node, "publish-delay-secs")?
            .unwrap_or_else(default_publish_delay),
    })
}
