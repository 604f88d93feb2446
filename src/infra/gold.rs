// ============================================================
// Layer 6 — Gold Labels
// ============================================================
// Reads `<data_root>/<split>.csv`:
//
//   id,labels
//   clip-0001,0;17;212
//   clip-0002,5
//
// The first line is a header. Labels are indices into the
// label set, separated by ';'. Only the reporting path reads
// this file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Default)]
pub struct GoldLabels {
    nlabel: usize,
    rows:   HashMap<String, Vec<usize>>,
}

impl GoldLabels {
    pub fn load(path: impl AsRef<Path>, nlabel: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read gold file '{}'", path.display()))?;
        Self::parse(&text, nlabel).with_context(|| format!("Bad gold file '{}'", path.display()))
    }

    pub fn parse(text: &str, nlabel: usize) -> Result<Self> {
        let mut rows = HashMap::new();
        for (lineno, line) in text.lines().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (id, labels) = line.split_once(',').unwrap_or((line, ""));
            let mut indices = Vec::new();
            for field in labels.split(';').map(str::trim).filter(|f| !f.is_empty()) {
                let k: usize = field
                    .parse()
                    .with_context(|| format!("line {}: label `{field}` is not an index", lineno + 1))?;
                if k >= nlabel {
                    bail!("line {}: label {k} is outside {nlabel} labels", lineno + 1);
                }
                indices.push(k);
            }
            rows.insert(id.trim().to_string(), indices);
        }
        Ok(Self { nlabel, rows })
    }

    /// Multi-hot row for `id`; `None` when the id is not listed.
    pub fn multi_hot(&self, id: &str) -> Option<Vec<f32>> {
        let labels = self.rows.get(id)?;
        let mut row = vec![0.0; self.nlabel];
        for &k in labels {
            row[k] = 1.0;
        }
        Some(row)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_header() {
        let gold = GoldLabels::parse("id,labels\na,0;2\nb,\n", 3).unwrap();
        assert!(gold.multi_hot("id").is_none());
        assert_eq!(gold.multi_hot("a").unwrap(), vec![1.0, 0.0, 1.0]);
        assert_eq!(gold.multi_hot("b").unwrap(), vec![0.0; 3]);
        assert!(gold.multi_hot("c").is_none());
    }

    #[test]
    fn test_out_of_range_label() {
        assert!(GoldLabels::parse("id,labels\na,3\n", 3).is_err());
    }
}
