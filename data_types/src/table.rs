//! Fully qualified warehouse table references.

use std::fmt;

/// `project.dataset.table` reference to a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableReference {
    /// Cloud project holding the dataset.
    pub project: String,
    /// Dataset holding the table.
    pub dataset: String,
    /// Table name.
    pub table: String,
}

impl TableReference {
    /// Create a table reference.
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_fully_qualified() {
        let table = TableReference::new("proj", "working", "traces_deduped_3");
        assert_eq!(table.to_string(), "proj.working.traces_deduped_3");
    }
}
