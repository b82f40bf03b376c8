//! On-disk lease database: a versioned JSON envelope rewritten atomically
//! (sibling temp file + rename, mode 0o640) after every mutation.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lease::{HwAddr, Lease};
use crate::{DhcpError, Result};

const DB_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    leases: Vec<Record>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    ip: String,
    mac: String,
    hostname: String,
    #[serde(rename = "static")]
    is_static: bool,
    /// RFC 3339 for dynamic leases, empty for static ones.
    expires: String,
}

/// Totals reported after a load.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadStats {
    pub v4: usize,
    pub v6: usize,
    pub skipped: usize,
}

impl LoadStats {
    pub fn total(&self) -> usize {
        self.v4 + self.v6
    }
}

pub struct LeaseDb {
    path: PathBuf,
}

impl LeaseDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the database. An absent file is an empty store, as is an
    /// envelope without the expected version. Records that fail to parse
    /// are logged and skipped; IPv6 records are counted for the caller and
    /// left to the v6 subsystem.
    pub fn load(&self) -> Result<(Vec<Lease>, LoadStats)> {
        if !self.path.exists() {
            return Ok((Vec::new(), LoadStats::default()));
        }

        let raw = fs::read_to_string(&self.path).map_err(DhcpError::Store)?;
        let envelope: Envelope = serde_json::from_str(&raw)
            .map_err(|e| DhcpError::Store(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        if envelope.version != DB_VERSION {
            warn!(
                "lease db {}: unsupported version {}, starting empty",
                self.path.display(),
                envelope.version
            );
            return Ok((Vec::new(), LoadStats::default()));
        }

        let mut leases = Vec::new();
        let mut stats = LoadStats::default();
        for record in envelope.leases {
            match record.to_lease() {
                Ok(Some(lease)) => {
                    stats.v4 += 1;
                    leases.push(lease);
                }
                Ok(None) => stats.v6 += 1,
                Err(e) => {
                    warn!("lease db: skipping record for {:?}: {e}", record.ip);
                    stats.skipped += 1;
                }
            }
        }
        Ok((leases, stats))
    }

    /// Rewrites the database atomically with records in ascending hostname
    /// order.
    pub fn store(&self, leases: &[Lease]) -> Result<()> {
        let mut records: Vec<Record> = leases.iter().map(Record::from_lease).collect();
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let envelope = Envelope {
            version: DB_VERSION,
            leases: records,
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| DhcpError::Store(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(DhcpError::Store)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o640))
                .map_err(DhcpError::Store)?;
        }
        fs::rename(&tmp, &self.path).map_err(DhcpError::Store)?;
        Ok(())
    }
}

impl Record {
    fn from_lease(lease: &Lease) -> Self {
        Self {
            ip: lease.ip.to_string(),
            mac: lease.hwaddr.to_string(),
            hostname: lease.hostname.clone(),
            is_static: lease.is_static,
            expires: if lease.is_static {
                String::new()
            } else {
                lease.expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
            },
        }
    }

    /// `Ok(None)` for an IPv6 record.
    fn to_lease(&self) -> Result<Option<Lease>> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| DhcpError::State(format!("invalid address {:?}", self.ip)))?;
        let ip = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return Ok(None),
        };

        let hwaddr = HwAddr::parse(&self.mac)?;

        let expiry = if self.is_static {
            DateTime::UNIX_EPOCH
        } else {
            DateTime::parse_from_rfc3339(&self.expires)
                .map_err(|_| DhcpError::State(format!("invalid expiry {:?}", self.expires)))?
                .with_timezone(&Utc)
        };

        Ok(Some(Lease {
            ip,
            hwaddr,
            hostname: self.hostname.clone(),
            expiry,
            is_static: self.is_static,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn hw(s: &str) -> HwAddr {
        HwAddr::parse(s).unwrap()
    }

    #[test]
    fn test_absent_file_is_empty() {
        let dir = tempdir().unwrap();
        let db = LeaseDb::new(dir.path().join("leases.json"));
        let (leases, stats) = db.load().unwrap();
        assert!(leases.is_empty());
        assert_eq!(stats.total(), 0);
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let db = LeaseDb::new(dir.path().join("leases.json"));

        let originals = vec![
            Lease::dynamic(
                "192.168.0.100".parse().unwrap(),
                hw("aa:00:00:00:00:01"),
                "zeta".into(),
                t0(),
                Duration::hours(2),
            ),
            Lease::statik(
                "192.168.0.50".parse().unwrap(),
                hw("aa:00:00:00:00:02"),
                "alpha".into(),
            ),
            Lease::blocked("192.168.0.101".parse().unwrap(), t0() + Duration::hours(24)),
        ];
        db.store(&originals).unwrap();

        let (loaded, stats) = db.load().unwrap();
        assert_eq!(stats.v4, 3);
        assert_eq!(stats.skipped, 0);
        // Ascending hostname order: "", "alpha", "zeta".
        assert!(loaded[0].is_blocked());
        assert_eq!(loaded[1].hostname, "alpha");
        assert_eq!(loaded[2].hostname, "zeta");
        assert_eq!(loaded[2], originals[0]);
        assert_eq!(loaded[1].expiry, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_static_has_empty_expires_string() {
        let dir = tempdir().unwrap();
        let db = LeaseDb::new(dir.path().join("leases.json"));
        db.store(&[Lease::statik(
            "192.168.0.50".parse().unwrap(),
            hw("aa:00:00:00:00:02"),
            "nas".into(),
        )])
        .unwrap();

        let raw = fs::read_to_string(db.path()).unwrap();
        assert!(raw.contains(r#""expires":"""#));
        assert!(raw.contains(r#""version":1"#));
    }

    #[test]
    fn test_missing_version_is_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("leases.json");
        fs::write(
            &path,
            r#"{"leases":[{"ip":"10.0.0.1","mac":"aa:00:00:00:00:01","hostname":"x","static":false,"expires":"2024-05-01T12:00:00Z"}]}"#,
        )
        .unwrap();
        let (leases, stats) = LeaseDb::new(&path).load().unwrap();
        assert!(leases.is_empty());
        assert_eq!(stats.total(), 0);
    }

    #[test]
    fn test_bad_records_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("leases.json");
        fs::write(
            &path,
            r#"{"version":1,"leases":[
                {"ip":"10.0.0.1","mac":"not-a-mac","hostname":"bad","static":false,"expires":"2024-05-01T12:00:00Z"},
                {"ip":"10.0.0.2","mac":"aa:00:00:00:00:01","hostname":"late","static":false,"expires":"yesterday"},
                {"ip":"fd00::5","mac":"aa:00:00:00:00:02","hostname":"six","static":false,"expires":"2024-05-01T12:00:00Z"},
                {"ip":"10.0.0.3","mac":"aa:00:00:00:00:03","hostname":"good","static":false,"expires":"2024-05-01T12:00:00Z"}
            ]}"#,
        )
        .unwrap();

        let (leases, stats) = LeaseDb::new(&path).load().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].hostname, "good");
        assert_eq!(stats.v4, 1);
        assert_eq!(stats.v6, 1);
        assert_eq!(stats.skipped, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let db = LeaseDb::new(dir.path().join("leases.json"));
        db.store(&[]).unwrap();
        let mode = fs::metadata(db.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }
}
