//! Dense-switch analysis.
//!
//! The middle end decides switch-vs-if-chain at the source level; this
//! module decides whether a switch terminator is dense enough for LLVM's
//! jump table to pay off, mostly as a diagnostic for `emit-ir --verbose`
//! output and tests. LLVM makes the final call either way.

use std::collections::BTreeSet;

#[derive(Clone, Debug)]
pub struct JumpTableMetrics {
    pub case_count: usize,
    pub value_range: usize,
    /// cases / range; above 0.5 a table beats a cascade.
    pub density: f64,
    pub table_bytes: usize,
    pub cascade_bytes: usize,
}

impl JumpTableMetrics {
    pub fn table_wins(&self) -> bool {
        self.density > 0.5 && self.table_bytes < self.cascade_bytes
    }
}

#[derive(Clone, Debug)]
pub struct JumpTable {
    pub base: i128,
    /// entries[i] is the case index covering `base + i`.
    pub entries: Vec<Option<usize>>,
}

impl JumpTable {
    pub fn metrics(&self) -> JumpTableMetrics {
        let case_count = self.entries.iter().filter(|e| e.is_some()).count();
        let value_range = self.entries.len();
        JumpTableMetrics {
            case_count,
            value_range,
            density: case_count as f64 / value_range.max(1) as f64,
            table_bytes: 8 + value_range * 8,
            cascade_bytes: case_count * 12,
        }
    }
}

#[derive(Clone, Debug)]
pub enum SwitchLowering {
    Table(JumpTable),
    Cascade,
}

/// Build a table when the case values are dense enough, otherwise report a
/// cascade.
pub fn analyze_switch(values: &[i128]) -> SwitchLowering {
    let distinct: BTreeSet<i128> = values.iter().copied().collect();
    let (Some(&min), Some(&max)) = (distinct.first(), distinct.last()) else {
        return SwitchLowering::Cascade;
    };
    let Ok(range) = usize::try_from(max - min + 1) else {
        return SwitchLowering::Cascade;
    };
    if range > 1 << 16 {
        return SwitchLowering::Cascade;
    }
    let density = distinct.len() as f64 / range as f64;
    if density < 0.3 {
        return SwitchLowering::Cascade;
    }
    let mut entries = vec![None; range];
    for (case_index, v) in values.iter().enumerate() {
        let offset = (v - min) as usize;
        if entries[offset].is_none() {
            entries[offset] = Some(case_index);
        }
    }
    SwitchLowering::Table(JumpTable { base: min, entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_cases_build_a_table() {
        let SwitchLowering::Table(table) = analyze_switch(&[0, 1, 2, 3]) else {
            panic!("expected a table");
        };
        assert_eq!(table.base, 0);
        assert_eq!(table.entries.len(), 4);
        let metrics = table.metrics();
        assert_eq!(metrics.case_count, 4);
        assert!(metrics.density > 0.9);
    }

    #[test]
    fn sparse_cases_cascade() {
        assert!(matches!(
            analyze_switch(&[0, 1000, 1_000_000]),
            SwitchLowering::Cascade
        ));
    }

    #[test]
    fn lookup_respects_first_match() {
        let SwitchLowering::Table(table) = analyze_switch(&[5, 6, 6, 7]) else {
            panic!("expected a table");
        };
        // Duplicate case value keeps the first arm, matching source order.
        assert_eq!(table.entries[1], Some(1));
    }
}
