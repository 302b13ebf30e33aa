use crate::error::DeError;
use log::debug;
use std::collections::BTreeSet;
use std::io::BufRead;

/// A named reference gene set.
#[derive(Debug, Clone, PartialEq)]
pub struct RefSet {
    pub name: String,
    pub description: String,
    pub genes: BTreeSet<String>,
}

impl RefSet {
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn contains(&self, gene: &str) -> bool {
        self.genes.contains(gene)
    }
}

/// Collection of reference gene sets.
#[derive(Debug, Clone, Default)]
pub struct RefSets {
    sets: Vec<RefSet>,
}

impl RefSets {
    pub fn new() -> Self {
        RefSets::default()
    }

    /// Add a set; adding a name twice merges the genes into the existing set.
    pub fn add<S: AsRef<str>>(&mut self, name: &str, description: &str, genes: &[S]) {
        let genes = genes.iter().map(|g| g.as_ref().to_string());
        match self.sets.iter_mut().find(|s| s.name == name) {
            Some(existing) => existing.genes.extend(genes),
            None => self.sets.push(RefSet {
                name: name.to_string(),
                description: description.to_string(),
                genes: genes.collect(),
            }),
        }
    }

    /// Read tab separated lines `name<TAB>description<TAB>gene<TAB>gene...`.
    ///
    /// Blank lines and lines starting with `#` are ignored.
    pub fn from_gmt_reader<R: BufRead>(reader: R) -> anyhow::Result<Self> {
        let mut sets = RefSets::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(DeError::from)?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or("").trim();
            let description = fields.next().ok_or_else(|| {
                DeError::InvalidParameter(format!(
                    "gene set line {} needs a name and a description column",
                    i + 1
                ))
            })?;
            if name.is_empty() {
                return Err(DeError::InvalidParameter(format!("gene set line {} has no name", i + 1)).into());
            }
            let genes: Vec<&str> = fields.map(str::trim).filter(|g| !g.is_empty()).collect();
            sets.add(name, description.trim(), &genes);
        }
        Ok(sets)
    }

    pub fn from_gmt_str(content: &str) -> anyhow::Result<Self> {
        Self::from_gmt_reader(content.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn sets(&self) -> &[RefSet] {
        &self.sets
    }

    pub fn get(&self, name: &str) -> Option<&RefSet> {
        self.sets.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.sets.iter().map(|s| s.name.as_str()).collect()
    }

    /// Keep only genes present in `background` and drop sets that become empty.
    pub fn intersect_background<S: AsRef<str>>(&mut self, background: &[S]) {
        let background: BTreeSet<&str> = background.iter().map(|g| g.as_ref()).collect();
        for set in &mut self.sets {
            set.genes.retain(|g| background.contains(g.as_str()));
        }
        let before = self.sets.len();
        self.sets.retain(|s| !s.is_empty());
        if self.sets.len() < before {
            debug!(
                "refsets: dropped {} sets without genes in the background",
                before - self.sets.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gmt_lines() {
        let sets = RefSets::from_gmt_str(
            "# comment\nsetA\tfirst set\tg1\tg2\tg3\n\nsetB\t\tg3\tg4\r\n",
        )
        .unwrap();
        assert_eq!(sets.names(), vec!["setA", "setB"]);
        assert_eq!(sets.get("setA").unwrap().len(), 3);
        assert_eq!(sets.get("setA").unwrap().description, "first set");
        assert!(sets.get("setB").unwrap().contains("g4"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(RefSets::from_gmt_str("only_a_name\n").is_err());
        assert!(RefSets::from_gmt_str("\tdesc\tg1\n").is_err());
    }

    #[test]
    fn add_merges_and_background_filters() {
        let mut sets = RefSets::new();
        sets.add("a", "", &["g1", "g2"]);
        sets.add("a", "", &["g2", "g3"]);
        sets.add("b", "", &["x1"]);
        assert_eq!(sets.get("a").unwrap().len(), 3);

        sets.intersect_background(&["g1", "g3", "g9"]);
        assert_eq!(sets.len(), 1);
        let a = sets.get("a").unwrap();
        assert!(a.contains("g1") && a.contains("g3") && !a.contains("g2"));
    }
}
