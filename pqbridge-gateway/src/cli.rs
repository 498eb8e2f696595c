//! Command-line handling

use clap::Parser;
use pqbridge_core::KeyExchangeGroup;

#[derive(Parser, Debug)]
#[command(name = "pqbridge-gateway")]
#[command(about = "PQ Bridge Gateway - Publishes serial sensor readings over MQTT/TLS", long_about = None)]
pub struct Args {
    /// Key exchange group offered in the TLS handshake
    pub group: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

/// What the gateway should do with the given arguments
#[derive(Debug, PartialEq, Eq)]
pub enum CliOutcome {
    /// Print this text and exit successfully without connecting
    Usage(String),
    Run(KeyExchangeGroup),
}

impl Args {
    pub fn outcome(&self) -> CliOutcome {
        match self.group.as_deref() {
            None => CliOutcome::Usage(usage("Missing key exchange group")),
            Some(name) => match name.parse::<KeyExchangeGroup>() {
                Ok(group) => CliOutcome::Run(group),
                Err(e) => CliOutcome::Usage(usage(&e.to_string())),
            },
        }
    }
}

fn usage(reason: &str) -> String {
    format!(
        "{}\nUsage: pqbridge-gateway <group> [--log-level LEVEL]\n  <group> is one of: {}\n  \
         Only {} can complete a handshake with this TLS backend; the others fail at startup",
        reason,
        KeyExchangeGroup::allowed_names(),
        KeyExchangeGroup::available_names()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(argv: &[&str]) -> CliOutcome {
        Args::try_parse_from(argv).unwrap().outcome()
    }

    #[test]
    fn test_valid_group() {
        assert_eq!(
            outcome(&["pqbridge-gateway", "X25519"]),
            CliOutcome::Run(KeyExchangeGroup::X25519)
        );
        assert_eq!(
            outcome(&["pqbridge-gateway", "kyber512", "--log-level", "debug"]),
            CliOutcome::Run(KeyExchangeGroup::Kyber512)
        );
    }

    #[test]
    fn test_missing_group_prints_usage() {
        let CliOutcome::Usage(text) = outcome(&["pqbridge-gateway"]) else {
            panic!("expected usage");
        };
        assert!(text.contains("Usage: pqbridge-gateway"));
        assert!(text.contains("ntruhps2048509"));
        assert!(text.contains("Only P-256, X25519 can complete a handshake"));
    }

    #[test]
    fn test_unknown_group_prints_usage() {
        assert!(matches!(
            outcome(&["pqbridge-gateway", "x25519"]),
            CliOutcome::Usage(_)
        ));
        assert!(matches!(
            outcome(&["pqbridge-gateway", "kyber1024"]),
            CliOutcome::Usage(_)
        ));
    }

    #[test]
    fn test_default_log_level() {
        let args = Args::try_parse_from(["pqbridge-gateway", "P-256"]).unwrap();
        assert_eq!(args.log_level, "info");
    }
}
