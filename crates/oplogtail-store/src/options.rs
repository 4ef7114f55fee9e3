use std::path::PathBuf;

/// Options forwarded to a connector when it opens a connection
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Replica set name
    pub replica_set: Option<String>,

    /// TLS settings
    pub tls: TlsSettings,
}

/// TLS settings. Supplying any certificate material enables TLS.
#[derive(Clone, Default)]
pub struct TlsSettings {
    /// TLS explicitly requested
    pub enabled: bool,

    /// Certificate authority file
    pub ca_file: Option<PathBuf>,

    /// Client certificate file
    pub cert_file: Option<PathBuf>,

    /// Client key file (PEM)
    pub key_file: Option<PathBuf>,

    /// Passphrase for the client key
    pub key_password: Option<String>,
}

impl TlsSettings {
    pub fn is_enabled(&self) -> bool {
        self.enabled
            || self.ca_file.is_some()
            || self.cert_file.is_some()
            || self.key_file.is_some()
            || self.key_password.is_some()
    }
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("enabled", &self.is_enabled())
            .field("ca_file", &self.ca_file)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("key_password", &self.key_password.as_ref().map(|_| "***"))
            .finish()
    }
}
