//! Relations: ordered named columns plus text ingest.

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Type;

use crate::column::BaseColumn;

/// A table in the row store.
#[derive(Debug)]
pub struct Relation {
    name: String,
    columns: Vec<(String, BaseColumn)>,
}

impl Relation {
    pub fn new(name: impl Into<String>) -> Relation {
        Relation {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an empty column of `ty`.
    pub fn attach_column(&mut self, name: impl Into<String>, ty: &Type) -> Result<()> {
        self.columns
            .push((name.into(), BaseColumn::with_type(ty)?));
        Ok(())
    }

    /// Append an already-populated column; lengths must agree with the
    /// existing columns.
    pub fn attach_filled(&mut self, name: impl Into<String>, column: BaseColumn) -> Result<()> {
        if let Some((_, first)) = self.columns.first() {
            if first.len() != column.len() {
                return Err(InkFuseError::SchemaMismatch(format!(
                    "column length {} does not match relation length {}",
                    column.len(),
                    first.len()
                )));
            }
        }
        self.columns.push((name.into(), column));
        Ok(())
    }

    pub fn column(&self, name: &str) -> Result<&BaseColumn> {
        self.columns
            .iter()
            .find(|(col_name, _)| col_name == name)
            .map(|(_, col)| col)
            .ok_or_else(|| {
                InkFuseError::internal(format!("relation {} has no column {name}", self.name))
            })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, col)| col.len())
    }

    /// Ingest `|`-delimited rows, one per line, trailing `|` required.
    /// Returns the number of loaded rows; the first malformed row aborts
    /// the load.
    pub fn load_rows(&mut self, text: &str) -> Result<usize> {
        let mut loaded = 0_usize;
        for (line_no, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let row = line.strip_suffix('|').ok_or_else(|| {
                InkFuseError::SchemaMismatch(format!("line {}: missing trailing `|`", line_no + 1))
            })?;
            let fields: Vec<&str> = row.split('|').collect();
            if fields.len() != self.columns.len() {
                return Err(InkFuseError::SchemaMismatch(format!(
                    "line {}: got {} fields, schema has {}",
                    line_no + 1,
                    fields.len(),
                    self.columns.len()
                )));
            }
            for (field, (_, column)) in fields.iter().zip(self.columns.iter_mut()) {
                column.load_value(field)?;
            }
            loaded += 1;
        }
        tracing::debug!(relation = self.name, rows = loaded, "loaded rows");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Relation {
        let mut rel = Relation::new("orders");
        rel.attach_column("id", &Type::UnsignedInt(8)).unwrap();
        rel.attach_column("price", &Type::Float(8)).unwrap();
        rel.attach_column("comment", &Type::char_ptr()).unwrap();
        rel
    }

    #[test]
    fn loads_well_formed_rows() {
        let mut rel = sample();
        let n = rel
            .load_rows("1|9.5|first order|\n2|10.25|second|\n")
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(rel.num_rows(), 2);
        let BaseColumn::String(comments) = rel.column("comment").unwrap() else {
            panic!("wrong variant")
        };
        assert_eq!(comments.value(1), "second");
    }

    #[test]
    fn rejects_field_count_mismatch() {
        let mut rel = sample();
        assert!(matches!(
            rel.load_rows("1|9.5|\n"),
            Err(InkFuseError::SchemaMismatch(_))
        ));
        assert!(matches!(
            rel.load_rows("1|9.5|x|extra|\n"),
            Err(InkFuseError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn rejects_missing_trailing_delimiter() {
        let mut rel = sample();
        assert!(matches!(
            rel.load_rows("1|9.5|no trailing"),
            Err(InkFuseError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn rejects_unparsable_fields() {
        let mut rel = sample();
        assert!(matches!(
            rel.load_rows("not_a_number|9.5|x|\n"),
            Err(InkFuseError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn attach_filled_checks_length() {
        let mut rel = Relation::new("t");
        rel.attach_filled("a", BaseColumn::U8(vec![1, 2, 3])).unwrap();
        assert!(rel.attach_filled("b", BaseColumn::U8(vec![1])).is_err());
        rel.attach_filled("c", BaseColumn::U8(vec![4, 5, 6])).unwrap();
        assert_eq!(rel.num_rows(), 3);
    }
}
