//! Remote reader over SFTP
//!
//! Each call opens its own authenticated session; nothing is reused across
//! calls. Bytes are decoded as UTF-8 with lossy replacement.

use super::{error_level_pattern, LineFilter, LogReader, Tail};
use crate::error::{Error, Result};
use crate::types::{RemoteConnection, SourceKind};
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, Session, Sftp};
use std::io::{Read, Seek, SeekFrom};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// SFTP status code for a missing file or directory.
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Reads files from a remote host over SFTP.
///
/// Without an include filter, only lines matching [`error_level_pattern`]
/// are emitted.
#[derive(Debug, Clone)]
pub struct RemoteReader {
    conn: RemoteConnection,
    timeout: Option<Duration>,
}

/// Session plus SFTP channel; fields drop in declaration order.
struct SftpHandle {
    sftp: Sftp,
    _session: Session,
}

/// An open remote file that keeps its session alive.
struct RemoteFile {
    file: ssh2::File,
    _handle: SftpHandle,
}

impl Read for RemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for RemoteFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl RemoteReader {
    pub fn new(conn: RemoteConnection) -> Self {
        Self {
            conn,
            timeout: None,
        }
    }

    /// Bound every blocking network operation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connection(&self) -> &RemoteConnection {
        &self.conn
    }

    /// Try each resolved address in turn; the connect itself is bounded
    /// by the reader timeout when one is set.
    fn open_tcp(&self, addr: &str) -> Result<TcpStream> {
        let candidates = (self.conn.host.as_str(), self.conn.port)
            .to_socket_addrs()
            .map_err(|e| Error::unavailable(addr, format!("cannot resolve: {}", e)))?;

        let mut last_err = None;
        for sock in candidates {
            let attempt = match self.timeout {
                Some(timeout) => TcpStream::connect_timeout(&sock, timeout),
                None => TcpStream::connect(sock),
            };
            match attempt {
                Ok(tcp) => return Ok(tcp),
                Err(e) => {
                    tracing::debug!(remote = %addr, %sock, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => Error::unavailable(addr, e),
            None => Error::unavailable(addr, "host resolved to no addresses"),
        })
    }

    fn connect(&self) -> Result<SftpHandle> {
        let addr = self.conn.address();

        let tcp = self.open_tcp(&addr)?;
        if let Some(timeout) = self.timeout {
            tcp.set_read_timeout(Some(timeout))?;
            tcp.set_write_timeout(Some(timeout))?;
        }

        let mut session = Session::new().map_err(|e| Error::unavailable(&addr, e))?;
        if let Some(timeout) = self.timeout {
            session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        }
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::unavailable(&addr, format!("handshake failed: {}", e)))?;

        self.verify_host_key(&session)?;

        session
            .userauth_pubkey_file(
                &self.conn.username,
                None,
                &self.conn.key_path,
                self.conn.key_passphrase.as_deref(),
            )
            .map_err(|e| Error::unavailable(&addr, format!("authentication failed: {}", e)))?;
        if !session.authenticated() {
            return Err(Error::unavailable(&addr, "authentication rejected"));
        }

        let sftp = session
            .sftp()
            .map_err(|e| Error::unavailable(&addr, format!("sftp subsystem: {}", e)))?;

        tracing::debug!(remote = %addr, user = %self.conn.username, "SFTP session opened");

        Ok(SftpHandle {
            sftp,
            _session: session,
        })
    }

    fn verify_host_key(&self, session: &Session) -> Result<()> {
        let Some(known_hosts_path) = &self.conn.known_hosts else {
            return Ok(());
        };
        let addr = self.conn.address();

        let mut known_hosts = session.known_hosts()?;
        known_hosts
            .read_file(known_hosts_path, KnownHostFileKind::OpenSSH)
            .map_err(|e| {
                Error::Config(format!(
                    "failed to read known_hosts {}: {}",
                    known_hosts_path.display(),
                    e
                ))
            })?;

        let (key, _) = session
            .host_key()
            .ok_or_else(|| Error::unavailable(&addr, "server sent no host key"))?;

        match known_hosts.check_port(&self.conn.host, self.conn.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(Error::unavailable(&addr, "host key not in known_hosts")),
            CheckResult::Mismatch => Err(Error::unavailable(&addr, "host key mismatch")),
            CheckResult::Failure => Err(Error::unavailable(&addr, "host key check failed")),
        }
    }

    fn remote_target(&self, path: &str) -> String {
        format!("{}:{}", self.conn.address(), path)
    }
}

impl LogReader for RemoteReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    fn find_latest(&self, base_path: &str, file_glob: &str) -> Result<Option<String>> {
        let pattern = glob::Pattern::new(file_glob)
            .map_err(|e| Error::Config(format!("invalid file glob {:?}: {}", file_glob, e)))?;

        let handle = self.connect()?;
        let entries = match handle.sftp.readdir(Path::new(base_path)) {
            Ok(entries) => entries,
            Err(e) if is_no_such_file(&e) => {
                tracing::debug!(remote = %self.remote_target(base_path), "Remote log directory does not exist");
                return Ok(None);
            }
            Err(e) => return Err(Error::unavailable(self.remote_target(base_path), e)),
        };

        let latest = entries
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                pattern
                    .matches(&name)
                    .then_some((stat.mtime.unwrap_or(0), name))
            })
            .max();

        Ok(latest.map(|(_, name)| format!("{}/{}", base_path.trim_end_matches('/'), name)))
    }

    fn tail(&self, file_id: &str, start_offset: u64, filter: &LineFilter) -> Result<Tail> {
        let handle = self.connect()?;
        let mut file = handle
            .sftp
            .open(Path::new(file_id))
            .map_err(|e| Error::unavailable(self.remote_target(file_id), e))?;
        let file_len = file
            .stat()
            .map_err(|e| Error::unavailable(self.remote_target(file_id), e))?
            .size
            .unwrap_or(0);

        let remote = RemoteFile {
            file,
            _handle: handle,
        };
        let filter = filter.or_default_include(error_level_pattern());
        Tail::open(remote, file_len, start_offset, filter, file_id)
    }
}

fn is_no_such_file(error: &ssh2::Error) -> bool {
    matches!(error.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}
