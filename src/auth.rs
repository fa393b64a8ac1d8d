//! SASL authentication providers.
//!
//! A provider maps the connection's parameter map to the opaque response
//! blob sent in `connection.start-ok`. Providers are looked up by mechanism
//! name; `AMQPLAIN` and `PLAIN` are built in, and embedders can register
//! their own on the options.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{FieldTable, Value, WireWriter};
use crate::error::{AmqwireError, Result};

/// Parameter key naming the mechanism to use.
pub const MECHANISM: &str = "MECHANISM";
/// Parameter key for the login name.
pub const LOGIN: &str = "LOGIN";
/// Parameter key for the password.
pub const PASSWORD: &str = "PASSWORD";

/// The mechanism used when none is configured.
pub const DEFAULT_MECHANISM: &str = "AMQPLAIN";

/// A provider closure over the parameter map.
pub type AuthProvider = Arc<dyn Fn(&HashMap<String, String>) -> Result<Bytes> + Send + Sync>;

/// Default parameters: `{MECHANISM: AMQPLAIN, LOGIN: guest, PASSWORD: guest}`.
pub fn default_params() -> HashMap<String, String> {
    HashMap::from([
        (MECHANISM.to_string(), DEFAULT_MECHANISM.to_string()),
        (LOGIN.to_string(), "guest".to_string()),
        (PASSWORD.to_string(), "guest".to_string()),
    ])
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| AmqwireError::Client(format!("auth parameter '{key}' missing")))
}

/// AMQPLAIN: a field table of LOGIN/PASSWORD long-strings, serialized with
/// the four-octet table length stripped.
fn amqplain(params: &HashMap<String, String>) -> Result<Bytes> {
    let mut table = FieldTable::new();
    table.insert(LOGIN, Value::LongStr(required(params, LOGIN)?.to_string()));
    table.insert(
        PASSWORD,
        Value::LongStr(required(params, PASSWORD)?.to_string()),
    );

    let mut w = WireWriter::new();
    w.write_table(&table)?;
    Ok(w.finish().slice(4..))
}

/// PLAIN: `\0login\0password`.
fn plain(params: &HashMap<String, String>) -> Result<Bytes> {
    let login = required(params, LOGIN)?;
    let password = required(params, PASSWORD)?;

    let mut blob = Vec::with_capacity(login.len() + password.len() + 2);
    blob.push(0);
    blob.extend_from_slice(login.as_bytes());
    blob.push(0);
    blob.extend_from_slice(password.as_bytes());
    Ok(Bytes::from(blob))
}

/// Registry of SASL providers, keyed by mechanism name.
#[derive(Clone)]
pub struct AuthRegistry {
    providers: HashMap<String, AuthProvider>,
}

impl AuthRegistry {
    /// Registry with the built-in mechanisms.
    pub fn new() -> Self {
        let mut registry = Self {
            providers: HashMap::new(),
        };
        registry.register("AMQPLAIN", Arc::new(amqplain));
        registry.register("PLAIN", Arc::new(plain));
        registry
    }

    /// Register a provider, replacing any existing one for the mechanism.
    pub fn register(&mut self, mechanism: impl Into<String>, provider: AuthProvider) {
        self.providers.insert(mechanism.into(), provider);
    }

    /// Produce the response blob for a mechanism.
    pub fn respond(
        &self,
        mechanism: &str,
        params: &HashMap<String, String>,
    ) -> Result<Bytes> {
        let provider = self.providers.get(mechanism).ok_or_else(|| {
            AmqwireError::Client(format!("no auth provider for mechanism '{mechanism}'"))
        })?;
        provider(params)
    }

    /// Whether a mechanism has a provider.
    pub fn supports(&self, mechanism: &str) -> bool {
        self.providers.contains_key(mechanism)
    }
}

impl Default for AuthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut mechanisms: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        mechanisms.sort_unstable();
        f.debug_struct("AuthRegistry")
            .field("mechanisms", &mechanisms)
            .finish()
    }
}
