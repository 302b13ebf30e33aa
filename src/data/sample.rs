use crate::error::DeError;
use std::collections::HashMap;
use std::io::Read;

/// One per-cell annotation column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Categorical(Vec<String>),
    Numeric(Vec<f64>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Categorical(v) => v.len(),
            Column::Numeric(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn subset(&self, cells: &[usize]) -> Column {
        match self {
            Column::Categorical(v) => Column::Categorical(cells.iter().map(|&c| v[c].clone()).collect()),
            Column::Numeric(v) => Column::Numeric(cells.iter().map(|&c| v[c]).collect()),
        }
    }
}

/// Per-cell annotations used to build design matrices and groupings.
#[derive(Debug, Clone)]
pub struct SampleDescription {
    n_cells: usize,
    names: Vec<String>,
    columns: HashMap<String, Column>,
}

impl SampleDescription {
    pub fn new(n_cells: usize) -> Self {
        SampleDescription {
            n_cells,
            names: Vec::new(),
            columns: HashMap::new(),
        }
    }

    pub fn with_column(mut self, name: &str, column: Column) -> anyhow::Result<Self> {
        self.insert(name, column)?;
        Ok(self)
    }

    pub fn with_categorical<S: AsRef<str>>(self, name: &str, values: &[S]) -> anyhow::Result<Self> {
        let values = values.iter().map(|v| v.as_ref().to_string()).collect();
        self.with_column(name, Column::Categorical(values))
    }

    pub fn with_numeric(self, name: &str, values: Vec<f64>) -> anyhow::Result<Self> {
        self.with_column(name, Column::Numeric(values))
    }

    /// Add or replace a column.
    pub fn insert(&mut self, name: &str, column: Column) -> anyhow::Result<()> {
        if column.len() != self.n_cells {
            return Err(DeError::dimension(&format!("column '{}'", name), self.n_cells, column.len()).into());
        }
        if let Column::Numeric(values) = &column {
            if let Some(i) = values.iter().position(|v| !v.is_finite()) {
                return Err(DeError::InvalidParameter(format!(
                    "column '{}' has a non-finite value at cell {}",
                    name, i
                ))
                .into());
            }
        }
        if !self.columns.contains_key(name) {
            self.names.push(name.to_string());
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> anyhow::Result<&Column> {
        self.columns
            .get(name)
            .ok_or_else(|| DeError::MissingColumn(name.to_string()).into())
    }

    /// Sorted distinct levels of a categorical column.
    pub fn levels(&self, name: &str) -> anyhow::Result<Vec<String>> {
        match self.column(name)? {
            Column::Categorical(values) => {
                let mut levels = values.clone();
                levels.sort();
                levels.dedup();
                Ok(levels)
            }
            Column::Numeric(_) => Err(DeError::InvalidParameter(format!(
                "column '{}' is numeric and has no levels",
                name
            ))
            .into()),
        }
    }

    pub fn subset(&self, cells: &[usize]) -> SampleDescription {
        SampleDescription {
            n_cells: cells.len(),
            names: self.names.clone(),
            columns: self
                .columns
                .iter()
                .map(|(k, v)| (k.clone(), v.subset(cells)))
                .collect(),
        }
    }

    /// Read a CSV table whose first column holds cell identifiers.
    ///
    /// Columns listed in `numeric` are parsed as numbers, all others are kept as
    /// categorical labels. Returns the cell identifiers alongside the description.
    pub fn from_csv_reader<R: Read>(reader: R, numeric: &[&str]) -> anyhow::Result<(Vec<String>, Self)> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers: Vec<String> = rdr
            .headers()
            .map_err(DeError::from)?
            .iter()
            .map(|h| h.to_string())
            .collect();
        if headers.len() < 2 {
            return Err(DeError::EmptyData("sample description has no annotation columns".into()).into());
        }
        for name in numeric {
            if !headers[1..].iter().any(|h| h == name) {
                return Err(DeError::MissingColumn(name.to_string()).into());
            }
        }

        let mut cell_ids = Vec::new();
        let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len() - 1];
        for record in rdr.records() {
            let record = record.map_err(DeError::from)?;
            cell_ids.push(record.get(0).unwrap_or_default().to_string());
            for (j, column) in raw.iter_mut().enumerate() {
                column.push(record.get(j + 1).unwrap_or_default().trim().to_string());
            }
        }

        let mut description = SampleDescription::new(cell_ids.len());
        for (name, values) in headers[1..].iter().zip(raw) {
            let column = if numeric.contains(&name.as_str()) {
                let parsed = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        v.parse::<f64>().map_err(|_| {
                            DeError::InvalidParameter(format!(
                                "column '{}' row {}: '{}' is not numeric",
                                name, i, v
                            ))
                        })
                    })
                    .collect::<Result<Vec<f64>, DeError>>()?;
                Column::Numeric(parsed)
            } else {
                Column::Categorical(values)
            };
            description.insert(name, column)?;
        }
        Ok((cell_ids, description))
    }
}

/// Assignment of every cell to one group of a categorical variable.
#[derive(Debug, Clone)]
pub struct Grouping {
    groups: Vec<String>,
    codes: Vec<usize>,
}

impl Grouping {
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> anyhow::Result<Self> {
        if labels.is_empty() {
            return Err(DeError::EmptyData("grouping has no cells".into()).into());
        }
        let mut groups: Vec<String> = labels.iter().map(|l| l.as_ref().to_string()).collect();
        groups.sort();
        groups.dedup();
        let codes = labels
            .iter()
            .map(|l| groups.binary_search_by(|g| g.as_str().cmp(l.as_ref())).unwrap_or(0))
            .collect();
        Ok(Grouping { groups, codes })
    }

    pub fn from_description(description: &SampleDescription, column: &str) -> anyhow::Result<Self> {
        match description.column(column)? {
            Column::Categorical(values) => Self::from_labels(values),
            Column::Numeric(_) => Err(DeError::InvalidParameter(format!(
                "grouping column '{}' must be categorical",
                column
            ))
            .into()),
        }
    }

    pub fn n_cells(&self) -> usize {
        self.codes.len()
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Sorted group labels; the first is the reference group.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    pub fn group_index(&self, label: &str) -> Option<usize> {
        self.groups.iter().position(|g| g == label)
    }

    pub fn label(&self, cell: usize) -> &str {
        &self.groups[self.codes[cell]]
    }

    /// Cells belonging to group `g`.
    pub fn cells_of(&self, g: usize) -> Vec<usize> {
        self.codes
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| if c == g { Some(i) } else { None })
            .collect()
    }

    pub fn mask_of(&self, g: usize) -> Vec<bool> {
        self.codes.iter().map(|&c| c == g).collect()
    }

    pub fn labels(&self) -> Vec<String> {
        (0..self.n_cells()).map(|i| self.label(i).to_string()).collect()
    }

    pub fn subset(&self, cells: &[usize]) -> anyhow::Result<Self> {
        let labels: Vec<&str> = cells.iter().map(|&c| self.label(c)).collect();
        Self::from_labels(&labels)
    }

    pub fn require_cells(&self, n_cells: usize) -> anyhow::Result<()> {
        if self.n_cells() != n_cells {
            return Err(DeError::dimension("grouping", n_cells, self.n_cells()).into());
        }
        Ok(())
    }

    pub fn require_groups(&self, n: usize) -> anyhow::Result<()> {
        if self.n_groups() != n {
            return Err(DeError::InvalidParameter(format!(
                "expected exactly {} groups, found {}: {:?}",
                n,
                self.n_groups(),
                self.groups
            ))
            .into());
        }
        Ok(())
    }

    pub fn require_min_groups(&self, n: usize) -> anyhow::Result<()> {
        if self.n_groups() < n {
            return Err(DeError::InvalidParameter(format!(
                "expected at least {} groups, found {}",
                n,
                self.n_groups()
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_sorts_levels() {
        let g = Grouping::from_labels(&["b", "a", "c", "a"]).unwrap();
        assert_eq!(g.groups(), &["a", "b", "c"]);
        assert_eq!(g.codes(), &[1, 0, 2, 0]);
        assert_eq!(g.cells_of(0), vec![1, 3]);
        assert_eq!(g.mask_of(2), vec![false, false, true, false]);
        assert!(g.require_groups(2).is_err());
        assert!(g.require_min_groups(3).is_ok());
    }

    #[test]
    fn description_validates_lengths() {
        let d = SampleDescription::new(3);
        assert!(d.clone().with_categorical("cond", &["a", "b"]).is_err());
        let d = d
            .with_categorical("cond", &["a", "b", "a"])
            .unwrap()
            .with_numeric("age", vec![1.0, 2.0, 3.0])
            .unwrap();
        assert_eq!(d.levels("cond").unwrap(), vec!["a", "b"]);
        assert!(d.levels("age").is_err());
        let err = d.column("missing").unwrap_err();
        assert!(matches!(err.downcast_ref::<DeError>(), Some(DeError::MissingColumn(_))));
        assert!(Grouping::from_description(&d, "age").is_err());
    }

    #[test]
    fn description_subset() {
        let d = SampleDescription::new(3)
            .with_categorical("cond", &["a", "b", "c"])
            .unwrap();
        let s = d.subset(&[2, 0]);
        assert_eq!(s.n_cells(), 2);
        assert_eq!(
            s.column("cond").unwrap(),
            &Column::Categorical(vec!["c".into(), "a".into()])
        );
    }

    #[test]
    fn reads_csv() {
        let data = "cell,cond,depth\nc1,ctrl,1.5\nc2,treat,2\n";
        let (ids, d) = SampleDescription::from_csv_reader(data.as_bytes(), &["depth"]).unwrap();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(d.column("depth").unwrap(), &Column::Numeric(vec![1.5, 2.0]));
        assert_eq!(d.levels("cond").unwrap(), vec!["ctrl", "treat"]);

        let bad = "cell,depth\nc1,x\n";
        assert!(SampleDescription::from_csv_reader(bad.as_bytes(), &["depth"]).is_err());
    }
}
