//! Detector module table.
//!
//! The table is loaded once at startup and shared read-only (`Arc<DetectorModel>`)
//! by the rebinning and analysis stages. Modules are indexed in ascending
//! `module_id` order; that index is the column used by every per-module buffer.

use crate::error::{SnError, SnResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Highest in-ice string number.
pub const MAX_INICE_STRING: u16 = 86;

/// Relative efficiency of high quantum efficiency modules when the table gives none.
pub const DENSE_RELATIVE_EFFICIENCY: f64 = 1.35;

/// Module deployment class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleType {
    /// Standard in-ice module
    InIce,
    /// High quantum efficiency module in the dense infill
    InIceDense,
    /// Surface tank module, not used by the burst search
    Surface,
}

impl ModuleType {
    fn parse(code: &str) -> Option<Self> {
        match code.to_ascii_lowercase().as_str() {
            "i" | "ii" => Some(ModuleType::InIce),
            "d" | "dc" | "hq" => Some(ModuleType::InIceDense),
            "t" | "it" => Some(ModuleType::Surface),
            _ => None,
        }
    }

    /// Single-letter code used in table files.
    pub fn code(self) -> &'static str {
        match self {
            ModuleType::InIce => "i",
            ModuleType::InIceDense => "d",
            ModuleType::Surface => "t",
        }
    }

    /// Efficiency assumed when the table has no explicit value.
    pub fn default_relative_efficiency(self) -> f64 {
        match self {
            ModuleType::InIceDense => DENSE_RELATIVE_EFFICIENCY,
            ModuleType::InIce | ModuleType::Surface => 1.0,
        }
    }
}

/// One row of the module table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// 48-bit mainboard identifier
    pub module_id: u64,
    /// String (cable) number
    pub string: u16,
    /// Position along the string
    pub position: u16,
    /// Coordinates in metres
    pub x: f64,
    #[allow(missing_docs)]
    pub y: f64,
    #[allow(missing_docs)]
    pub z: f64,
    /// Deployment class
    pub module_type: ModuleType,
    /// Sensitivity weight for the likelihood sum
    pub effective_volume: f64,
    /// Photon detection efficiency relative to a standard module
    pub relative_efficiency: f64,
}

/// Immutable module lookup table.
#[derive(Debug, Clone)]
pub struct DetectorModel {
    modules: Vec<ModuleRecord>,
    index: HashMap<u64, usize>,
}

impl DetectorModel {
    /// Build from decoded rows. Rows are re-ordered by `module_id`.
    pub fn from_records(mut modules: Vec<ModuleRecord>) -> SnResult<Self> {
        modules.sort_by_key(|m| m.module_id);
        if let Some(pair) = modules.windows(2).find(|w| w[0].module_id == w[1].module_id) {
            return Err(SnError::DetectorTable {
                line: 0,
                reason: format!("duplicate module id {:012x}", pair[0].module_id),
            });
        }
        let index = modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.module_id, i))
            .collect();
        Ok(Self { modules, index })
    }

    /// Parse the whitespace-separated text table.
    ///
    /// Columns: `string position x y z module_id(hex) type effective_volume [relative_efficiency]`.
    /// Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> SnResult<Self> {
        let mut modules = Vec::new();
        let mut seen: HashMap<u64, usize> = HashMap::new();
        for (n, raw) in text.lines().enumerate() {
            let line = n + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let record = parse_row(content).map_err(|reason| SnError::DetectorTable { line, reason })?;
            if let Some(first) = seen.insert(record.module_id, line) {
                return Err(SnError::DetectorTable {
                    line,
                    reason: format!(
                        "module id {:012x} already defined on line {first}",
                        record.module_id
                    ),
                });
            }
            modules.push(record);
        }
        Self::from_records(modules)
    }

    /// Read and parse a table file.
    pub fn load<P: AsRef<Path>>(path: P) -> SnResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// All modules in index order.
    pub fn modules(&self) -> &[ModuleRecord] {
        &self.modules
    }

    /// Module at a buffer index.
    pub fn module(&self, index: usize) -> Option<&ModuleRecord> {
        self.modules.get(index)
    }

    /// Buffer index of a module id.
    pub fn index_of(&self, module_id: u64) -> Option<usize> {
        self.index.get(&module_id).copied()
    }

    /// Buffer index of a module id, or `UnknownModule`.
    pub fn lookup(&self, module_id: u64) -> SnResult<usize> {
        self.index_of(module_id)
            .ok_or(SnError::UnknownModule(module_id))
    }

    /// Whether the module exists and takes part in the burst search.
    pub fn is_valid(&self, module_id: u64) -> bool {
        self.index_of(module_id)
            .is_some_and(|i| self.participates(i))
    }

    /// Whether the module at `index` takes part in the burst search.
    pub fn participates(&self, index: usize) -> bool {
        self.modules
            .get(index)
            .is_some_and(|m| m.module_type != ModuleType::Surface)
    }

    /// Whether a string number belongs to the in-ice array.
    pub fn is_valid_string(&self, string: u16) -> bool {
        (1..=MAX_INICE_STRING).contains(&string)
    }

    /// Relative efficiencies in index order.
    pub fn efficiencies(&self) -> Vec<f64> {
        self.modules.iter().map(|m| m.relative_efficiency).collect()
    }

    /// Render the table in the format `parse` reads, efficiencies explicit.
    pub fn to_table(&self) -> String {
        let mut out = String::from("# string position x y z module_id type effective_volume relative_efficiency\n");
        for m in &self.modules {
            out.push_str(&format!(
                "{} {} {} {} {} {:012x} {} {} {}\n",
                m.string,
                m.position,
                m.x,
                m.y,
                m.z,
                m.module_id,
                m.module_type.code(),
                m.effective_volume,
                m.relative_efficiency
            ));
        }
        out
    }
}

fn parse_row(content: &str) -> Result<ModuleRecord, String> {
    let cols: Vec<&str> = content.split_whitespace().collect();
    if !(8..=9).contains(&cols.len()) {
        return Err(format!("expected 8 or 9 columns, found {}", cols.len()));
    }
    let float = |i: usize, what: &str| {
        cols[i]
            .parse::<f64>()
            .map_err(|_| format!("invalid {what} '{}'", cols[i]))
    };
    let small = |i: usize, what: &str| {
        cols[i]
            .parse::<u16>()
            .map_err(|_| format!("invalid {what} '{}'", cols[i]))
    };

    let module_id = u64::from_str_radix(cols[5].trim_start_matches("0x"), 16)
        .map_err(|_| format!("invalid module id '{}'", cols[5]))?;
    if module_id > crate::payload::MAX_48BIT {
        return Err(format!("module id '{}' exceeds 48 bits", cols[5]));
    }
    let module_type =
        ModuleType::parse(cols[6]).ok_or_else(|| format!("unknown module type '{}'", cols[6]))?;
    let relative_efficiency = match cols.get(8) {
        Some(_) => float(8, "relative efficiency")?,
        None => module_type.default_relative_efficiency(),
    };
    if !(relative_efficiency > 0.0) {
        return Err(format!("relative efficiency {relative_efficiency} must be positive"));
    }

    Ok(ModuleRecord {
        module_id,
        string: small(0, "string")?,
        position: small(1, "position")?,
        x: float(2, "x")?,
        y: float(3, "y")?,
        z: float(4, "z")?,
        module_type,
        effective_volume: float(7, "effective volume")?,
        relative_efficiency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
# str pos x y z mbid type effvol
1 1 -256.14 -521.08 500.0 7d5e8a0b3c21 i 1.0
36 44 -29.0 -7.0 -280.0 0a1b2c3d4e5f d 1.2
1 61 -264.0 -530.0 1950.0 123456789abc t 0.0
21 30 10.0 20.0 -100.0 00000000beef i 0.9 1.1   # explicit efficiency
";

    #[test]
    fn test_parse_orders_by_module_id() {
        let det = DetectorModel::parse(TABLE).unwrap();
        assert_eq!(det.len(), 4);
        let ids: Vec<u64> = det.modules().iter().map(|m| m.module_id).collect();
        assert_eq!(ids, vec![0xbeef, 0x0a1b_2c3d_4e5f, 0x1234_5678_9abc, 0x7d5e_8a0b_3c21]);
        assert_eq!(det.index_of(0xbeef), Some(0));
        assert_eq!(det.module(1).unwrap().string, 36);
    }

    #[test]
    fn test_default_and_explicit_efficiency() {
        let det = DetectorModel::parse(TABLE).unwrap();
        let eff = det.efficiencies();
        assert_eq!(eff, vec![1.1, 1.35, 1.0, 1.0]);
    }

    #[test]
    fn test_validity() {
        let det = DetectorModel::parse(TABLE).unwrap();
        assert!(det.is_valid(0x7d5e_8a0b_3c21));
        assert!(!det.is_valid(0x1234_5678_9abc)); // surface
        assert!(!det.is_valid(0xdead)); // unknown
        assert!(matches!(det.lookup(0xdead), Err(SnError::UnknownModule(0xdead))));
        assert!(det.is_valid_string(86));
        assert!(!det.is_valid_string(87));
        assert!(!det.is_valid_string(0));
    }

    #[test]
    fn test_table_text_reparses() {
        let det = DetectorModel::parse(TABLE).unwrap();
        let again = DetectorModel::parse(&det.to_table()).unwrap();
        assert_eq!(again.modules(), det.modules());
    }

    #[test]
    fn test_duplicate_and_malformed_rows() {
        let dup = "1 1 0 0 0 abc i 1\n2 2 0 0 0 ABC i 1\n";
        match DetectorModel::parse(dup) {
            Err(SnError::DetectorTable { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        let bad_type = "1 1 0 0 0 abc x 1\n";
        assert!(DetectorModel::parse(bad_type).is_err());
        let short = "1 1 0 0 0 abc\n";
        assert!(DetectorModel::parse(short).is_err());
    }
}
