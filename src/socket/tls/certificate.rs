use crate::base::neterror::NetError;
use boring::pkey::{PKey, Private};
use boring::ssl::SslContextBuilder;
use boring::x509::X509;
use std::fs;
use std::path::Path;

/// PEM certificate chain plus private key.
///
/// Material is kept as PEM so option sets compare structurally; it is
/// parsed when a TLS context is built.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Certificate {
    chain_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("chain_len", &self.chain_pem.len())
            .finish_non_exhaustive()
    }
}

impl Certificate {
    pub fn from_pem(chain_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            chain_pem: chain_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Loads a certificate chain and key. When `key_file` is `None` the key
    /// is expected in `cert_file` as well.
    pub fn from_files(
        cert_file: impl AsRef<Path>,
        key_file: Option<&Path>,
    ) -> Result<Self, NetError> {
        let cert_file = cert_file.as_ref();
        let chain_pem = read_pem(cert_file)?;
        let key_pem = match key_file {
            Some(path) => read_pem(path)?,
            None => chain_pem.clone(),
        };
        Ok(Self { chain_pem, key_pem })
    }

    pub(crate) fn chain(&self) -> Result<Vec<X509>, NetError> {
        let chain = X509::stack_from_pem(&self.chain_pem)
            .map_err(|e| NetError::InvalidTlsConfig(format!("certificate: {e}")))?;
        if chain.is_empty() {
            return Err(NetError::InvalidTlsConfig(
                "certificate: no PEM certificate found".into(),
            ));
        }
        Ok(chain)
    }

    pub(crate) fn key(&self) -> Result<PKey<Private>, NetError> {
        PKey::private_key_from_pem(&self.key_pem)
            .map_err(|e| NetError::InvalidTlsConfig(format!("private key: {e}")))
    }

    /// Installs the leaf, intermediates and key on a context builder.
    pub(crate) fn apply_to(&self, builder: &mut SslContextBuilder) -> Result<(), NetError> {
        let mut chain = self.chain()?.into_iter();
        let key = self.key()?;
        let config_err = |e: boring::error::ErrorStack| NetError::InvalidTlsConfig(e.to_string());

        if let Some(leaf) = chain.next() {
            builder.set_certificate(&leaf).map_err(config_err)?;
        }
        for extra in chain {
            builder.add_extra_chain_cert(extra).map_err(config_err)?;
        }
        builder.set_private_key(&key).map_err(config_err)?;
        builder.check_private_key().map_err(config_err)?;
        Ok(())
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, NetError> {
    fs::read(path).map_err(|e| {
        NetError::InvalidTlsConfig(format!("cannot read {}: {e}", path.display()))
    })
}
