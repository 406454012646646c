//! Configuration for the enclave service.
//!
//! Everything is resolved from CLI flags with environment-variable
//! fallbacks, so the usual deployment sets env vars only. `ENCLAVE_SECRET`
//! seeds the key-encryption key and is required; it is redacted from all
//! `Debug` output.

use clap::Parser;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::server::Framing;

/// The startup secret that seeds the key-encryption key.
///
/// Wrapped so a `Debug`-formatted [`Config`] can never leak it.
#[derive(Clone)]
pub struct EnclaveSecret(String);

impl EnclaveSecret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EnclaveSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnclaveSecret(<redacted>)")
    }
}

impl FromStr for EnclaveSecret {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("enclave secret must not be empty".to_string());
        }
        Ok(EnclaveSecret(s.to_string()))
    }
}

/// Server configuration, resolved from CLI arguments and environment.
#[derive(Parser, Debug)]
#[command(name = "pass-enclave")]
#[command(about = "PASS wallet enclave service")]
pub struct Config {
    /// Startup secret the key-encryption key is derived from.
    #[arg(long, env = "ENCLAVE_SECRET", hide_env_values = true)]
    pub enclave_secret: EnclaveSecret,

    /// Port for the loopback listener.
    #[arg(long, env = "HTTP_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Bind address; the enclave boundary is a local trusted channel.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Frame delimiting on the transport stream.
    #[arg(long, env = "FRAMING", value_enum, default_value_t = Framing::Newline)]
    pub framing: Framing,

    /// Upper bound in seconds on waiting for a wallet lock.
    #[arg(long, env = "LOCK_WAIT_SECS", default_value_t = 5)]
    pub lock_wait_secs: u64,
}

impl Config {
    pub fn load() -> Self {
        Config::parse()
    }
}
