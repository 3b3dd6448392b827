//! Host identity ledger (OpenSSH known_hosts layout)
//!
//! Every connect verifies the server's long-term key against the ledger.
//! The first entry naming the dialed host or the observed peer address
//! decides: its key must match exactly. Unknown hosts are only recorded when
//! the store was created with `accept_new`.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

use st_core::error::TrustError;
use st_core::types::DEFAULT_SSH_PORT;

/// One trusted host line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Canonical names this key is trusted for
    pub aliases: Vec<String>,
    /// Key algorithm token, e.g. `ssh-ed25519`
    pub key_type: String,
    /// SHA-256 fingerprint of the key
    pub fingerprint: String,
}

impl HostIdentity {
    fn for_key(host: &str, key: &PublicKey) -> Self {
        Self {
            aliases: vec![host.to_string()],
            key_type: key.name().to_string(),
            fingerprint: key.fingerprint(),
        }
    }

    /// Parse a ledger line.
    ///
    /// Returns `Ok(None)` for lines that can never match: blanks, comments,
    /// marker lines and hashed host names.
    pub fn parse_line(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            return Ok(None);
        }

        let mut parts = line.split_whitespace();
        let (hosts, key_type, blob) = match (parts.next(), parts.next(), parts.next()) {
            (Some(hosts), Some(key_type), Some(blob)) => (hosts, key_type, blob),
            _ => return Err("expected `hosts key-type key`".to_string()),
        };
        if hosts.starts_with('|') {
            return Ok(None);
        }

        let key = russh_keys::parse_public_key_base64(blob).map_err(|e| e.to_string())?;
        Ok(Some(Self {
            aliases: hosts.split(',').map(str::to_string).collect(),
            key_type: key_type.to_string(),
            fingerprint: key.fingerprint(),
        }))
    }

    /// Whether this entry is trusted for the canonical name
    pub fn matches(&self, name: &str) -> bool {
        self.aliases.iter().any(|alias| alias == name)
    }
}

/// A ledger line naming one or more hosts
#[derive(Debug)]
enum LedgerEntry {
    Trusted(HostIdentity),
    /// The line names hosts but its key could not be read. It still claims
    /// those names, so verifying any of them fails.
    Unreadable {
        aliases: Vec<String>,
        line: usize,
        reason: String,
    },
}

impl LedgerEntry {
    fn matches(&self, name: &str) -> bool {
        match self {
            LedgerEntry::Trusted(identity) => identity.matches(name),
            LedgerEntry::Unreadable { aliases, .. } => aliases.iter().any(|alias| alias == name),
        }
    }
}

/// Ledger contents cached after the first verification
#[derive(Debug, Default)]
struct Ledger {
    entries: Vec<LedgerEntry>,
    /// The file does not end in a newline, so an append must start one
    needs_newline: bool,
}

/// Verifies host keys against a persisted known_hosts ledger
#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    accept_new: bool,
    ledger: Mutex<Option<Ledger>>,
}

impl TrustStore {
    /// Create a store backed by `path`. Nothing is read until the first
    /// verification.
    pub fn new(path: impl Into<PathBuf>, accept_new: bool) -> Self {
        Self {
            path: path.into(),
            accept_new,
            ledger: Mutex::new(None),
        }
    }

    /// Verify `key` presented by the server dialed as `dialed` and reached at
    /// `observed`. Both are `host:port` strings.
    pub fn verify(&self, dialed: &str, observed: &str, key: &PublicKey) -> Result<(), TrustError> {
        let host = canonical_address(dialed)?;
        let address = canonical_address(observed)?;
        let presented = key.fingerprint();

        // Serializes concurrent verifications, so appends never interleave
        let mut guard = self.ledger.lock().unwrap_or_else(|e| e.into_inner());

        if guard.is_none() {
            match load_ledger(&self.path) {
                Ok(ledger) => *guard = Some(ledger),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if !self.accept_new {
                        return Err(TrustError::LedgerMissing {
                            host,
                            path: self.path.clone(),
                        });
                    }
                    create_ledger(&self.path, &host, key)?;
                    tracing::info!("Created {:?} with host key for {}", self.path, host);
                    *guard = Some(Ledger {
                        entries: vec![LedgerEntry::Trusted(HostIdentity::for_key(&host, key))],
                        needs_newline: false,
                    });
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let ledger = guard.get_or_insert_with(Ledger::default);

        match ledger
            .entries
            .iter()
            .find(|entry| entry.matches(&host) || entry.matches(&address))
        {
            Some(LedgerEntry::Unreadable { line, reason, .. }) => {
                tracing::error!(
                    "Entry for {} on line {} of {:?} is unreadable: {}",
                    host,
                    line,
                    self.path,
                    reason
                );
                return Err(TrustError::UnreadableEntry {
                    host,
                    path: self.path.clone(),
                    line: *line,
                    reason: reason.clone(),
                });
            }
            Some(LedgerEntry::Trusted(entry)) => {
                if entry.fingerprint == presented {
                    tracing::debug!("Host key for {} verified ({})", host, presented);
                    return Ok(());
                }
                tracing::error!(
                    "Host key for {} changed: expected {}, got {}",
                    host,
                    entry.fingerprint,
                    presented
                );
                return Err(TrustError::KeyMismatch {
                    host,
                    expected: entry.fingerprint.clone(),
                    presented,
                });
            }
            None => {}
        }

        if !self.accept_new {
            return Err(TrustError::UnknownHost { host });
        }

        append_entry(&self.path, &host, key, ledger.needs_newline)?;
        tracing::warn!("Permanently added {} ({}) to {:?}", host, presented, self.path);
        ledger
            .entries
            .push(LedgerEntry::Trusted(HostIdentity::for_key(&host, key)));
        ledger.needs_newline = false;
        Ok(())
    }
}

/// Canonical known_hosts name for a `host:port` string: the bare host for
/// the default port, `[host]:port` otherwise.
pub fn canonical_address(addr: &str) -> Result<String, TrustError> {
    let malformed = || TrustError::MalformedAddress(addr.to_string());

    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => {
            let (host, tail) = rest.split_once(']').ok_or_else(malformed)?;
            (host, tail.strip_prefix(':').ok_or_else(malformed)?)
        }
        None => {
            let (host, port) = addr.rsplit_once(':').ok_or_else(malformed)?;
            if host.contains(':') {
                return Err(malformed());
            }
            (host, port)
        }
    };

    if host.is_empty() {
        return Err(malformed());
    }
    let port: u16 = port.parse().map_err(|_| malformed())?;

    if port == DEFAULT_SSH_PORT {
        Ok(host.to_string())
    } else {
        Ok(format!("[{}]:{}", host, port))
    }
}

fn load_ledger(path: &Path) -> io::Result<Ledger> {
    let content = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        match HostIdentity::parse_line(line) {
            Ok(Some(entry)) => entries.push(LedgerEntry::Trusted(entry)),
            Ok(None) => {}
            Err(reason) => {
                tracing::warn!("Unreadable line {} of {:?}: {}", line_num + 1, path, reason);
                let aliases = line_aliases(line);
                if !aliases.is_empty() {
                    entries.push(LedgerEntry::Unreadable {
                        aliases,
                        line: line_num + 1,
                        reason,
                    });
                }
            }
        }
    }

    tracing::debug!("Loaded {} host keys from {:?}", entries.len(), path);
    Ok(Ledger {
        entries,
        needs_newline: !content.is_empty() && !content.ends_with('\n'),
    })
}

/// Host names claimed by a line, whether or not its key is readable
fn line_aliases(line: &str) -> Vec<String> {
    match line.split_whitespace().next() {
        Some(hosts) if !hosts.starts_with('|') => hosts
            .split(',')
            .filter(|alias| !alias.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn ledger_line(host: &str, key: &PublicKey) -> String {
    format!("{} {} {}\n", host, key.name(), key.public_key_base64())
}

fn create_ledger(path: &Path, host: &str, key: &PublicKey) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;
    }

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(file) => file,
        // Someone created it between our read and now; append instead
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return append_entry(path, host, key, false);
        }
        Err(e) => return Err(e),
    };
    file.write_all(ledger_line(host, key).as_bytes())
}

fn append_entry(path: &Path, host: &str, key: &PublicKey, needs_newline: bool) -> io::Result<()> {
    let mut line = ledger_line(host, key);
    if needs_newline {
        line.insert(0, '\n');
    }

    // One write on an O_APPEND descriptor keeps the line whole
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(line.as_bytes())
}
