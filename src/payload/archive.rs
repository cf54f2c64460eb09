//! Archive file naming: `sn_<run>_<seq>_<first_idx>_<last_idx>.dat`, optionally
//! followed by `.gz` or `.bz2`.

use crate::error::SnResult;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Compression applied to an archive file, taken from its suffix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Compression {
    /// Plain `.dat`
    #[default]
    None,
    /// `.gz`
    Gzip,
    /// `.bz2`
    Bzip2,
}

impl Compression {
    /// Compression implied by the last extension of `path`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Self::Gzip,
            Some("bz2") => Self::Bzip2,
            _ => Self::None,
        }
    }

    /// File name suffix after `.dat`.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
        }
    }
}

/// Metadata encoded in an archive file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveFileName {
    /// Run number
    pub run: u32,
    /// File sequence number within the run
    pub seq: u32,
    /// Index of the first record in the file
    pub first_idx: u64,
    /// Index of the last record in the file
    pub last_idx: u64,
    /// Compression suffix
    pub compression: Compression,
}

impl fmt::Display for ArchiveFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sn_{}_{:06}_{}_{}.dat{}",
            self.run,
            self.seq,
            self.first_idx,
            self.last_idx,
            self.compression.suffix()
        )
    }
}

impl FromStr for ArchiveFileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, compression) = if let Some(base) = s.strip_suffix(".gz") {
            (base, Compression::Gzip)
        } else if let Some(base) = s.strip_suffix(".bz2") {
            (base, Compression::Bzip2)
        } else {
            (s, Compression::None)
        };
        let stem = base
            .strip_prefix("sn_")
            .and_then(|rest| rest.strip_suffix(".dat"))
            .ok_or_else(|| format!("'{s}' is not an sn_*.dat archive name"))?;

        let fields: Vec<&str> = stem.split('_').collect();
        if fields.len() != 4 {
            return Err(format!("'{s}' has {} fields, expected 4", fields.len()));
        }
        let bad = |what: &str| format!("'{s}' has an invalid {what}");
        Ok(Self {
            run: fields[0].parse().map_err(|_| bad("run number"))?,
            seq: fields[1].parse().map_err(|_| bad("sequence number"))?,
            first_idx: fields[2].parse().map_err(|_| bad("first index"))?,
            last_idx: fields[3].parse().map_err(|_| bad("last index"))?,
            compression,
        })
    }
}

/// List archive files in `dir` ordered by run and sequence number.
///
/// Entries whose names do not parse are ignored.
pub fn scan_archive_dir<P: AsRef<Path>>(dir: P) -> SnResult<Vec<(ArchiveFileName, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Ok(parsed) = name.parse::<ArchiveFileName>() {
            found.push((parsed, entry.path()));
        }
    }
    found.sort_by_key(|(name, _)| (name.run, name.seq, name.first_idx));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_name() {
        let name: ArchiveFileName = "sn_260295_000431_133620063_133930082.dat".parse().unwrap();
        assert_eq!(
            name,
            ArchiveFileName {
                run: 260295,
                seq: 431,
                first_idx: 133620063,
                last_idx: 133930082,
                compression: Compression::None,
            }
        );
        assert_eq!(name.to_string(), "sn_260295_000431_133620063_133930082.dat");
    }

    #[test]
    fn test_rejects_other_names() {
        assert!("sn_1_2_3.dat".parse::<ArchiveFileName>().is_err());
        assert!("sn_1_2_3_x.dat".parse::<ArchiveFileName>().is_err());
        assert!("hitspool_1_2_3_4.dat".parse::<ArchiveFileName>().is_err());
        assert!("sn_1_2_3_4.dat.zip".parse::<ArchiveFileName>().is_err());
        assert!("sn_1_2_3_4.gz".parse::<ArchiveFileName>().is_err());
    }

    #[test]
    fn test_compressed_names() {
        let name: ArchiveFileName = "sn_12_000003_40_59.dat.bz2".parse().unwrap();
        assert_eq!(name.compression, Compression::Bzip2);
        assert_eq!((name.run, name.seq), (12, 3));
        assert_eq!(name.to_string(), "sn_12_000003_40_59.dat.bz2");
        assert_eq!(
            Compression::from_path(Path::new("/data/sn_1_000001_0_1.dat.gz")),
            Compression::Gzip
        );
    }

    #[test]
    fn test_scan_orders_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "sn_7_000010_900_999.dat",
            "sn_7_000002_100_199.dat.gz",
            "notes.txt",
            "sn_6_000099_0_5.dat",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let seqs: Vec<(u32, u32)> = scan_archive_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|(n, _)| (n.run, n.seq))
            .collect();
        assert_eq!(seqs, vec![(6, 99), (7, 2), (7, 10)]);
    }
}
