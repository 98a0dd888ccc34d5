//! KDL parsing for the configuration document.

use anyhow::{anyhow, Result};
use tracing::{trace, warn};

use crate::Config;

mod sections;

/// Parse a complete configuration document
pub fn parse_config(content: &str) -> Result<Config> {
    let doc: ::kdl::KdlDocument = content
        .parse()
        .map_err(|e: ::kdl::KdlError| anyhow!("Invalid KDL: {}", e))?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "storage" => config.storage = sections::parse_storage(node)?,
            "challenge" => config.challenge = sections::parse_challenge(node)?,
            "validator" => config.validator = sections::parse_validator(node)?,
            "issuance" => config.issuance = sections::parse_issuance(node)?,
            "local-ca" => config.local_ca = sections::parse_local_ca(node)?,
            "renewal" => config.renewal = sections::parse_renewal(node)?,
            "trust" => config.trust = sections::parse_trust(node)?,
            "client" => config.client = sections::parse_client(node)?,
            other => warn!(block = %other, "Ignoring unknown configuration block"),
        }
    }

    trace!("Finished parsing configuration");
    Ok(config)
}

/// First positional argument of a node as a string
pub(crate) fn get_first_arg_string(node: &::kdl::KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(str::to_string)
}

/// All positional string arguments of a node
pub(crate) fn get_string_args(node: &::kdl::KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(str::to_string)
        .collect()
}

fn child<'a>(node: &'a ::kdl::KdlNode, name: &str) -> Option<&'a ::kdl::KdlNode> {
    node.children().and_then(|doc| doc.get(name))
}

/// String value of the child node `name`
pub(crate) fn get_string_entry(node: &::kdl::KdlNode, name: &str) -> Option<String> {
    child(node, name).and_then(get_first_arg_string)
}

/// String values of the child node `name`
pub(crate) fn get_string_list(node: &::kdl::KdlNode, name: &str) -> Option<Vec<String>> {
    child(node, name).map(get_string_args)
}

/// Integer value of the child node `name`
pub(crate) fn get_int_entry(node: &::kdl::KdlNode, name: &str) -> Option<i128> {
    child(node, name)
        .and_then(|n| n.entries().iter().find(|e| e.name().is_none()))
        .and_then(|e| e.value().as_integer())
}

/// Non-negative integer value of the child node `name`, rejecting negatives
pub(crate) fn get_u64_entry(node: &::kdl::KdlNode, name: &str) -> Result<Option<u64>> {
    match get_int_entry(node, name) {
        Some(v) => u64::try_from(v)
            .map(Some)
            .map_err(|_| anyhow!("'{}' must be a non-negative integer, got {}", name, v)),
        None => Ok(None),
    }
}
