//! Table formatting utilities for structured output.

use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::index::BuildReport;
use crate::vector::VertexIndex;

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Create a new table builder.
    pub fn new() -> Self {
        Self {
            table: styled_table(),
        }
    }

    /// Set the table headers.
    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        let header_cells: Vec<Cell> = headers
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect();
        self.table.set_header(header_cells);
        self
    }

    /// Add a row to the table.
    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Build and return the formatted table.
    pub fn build(self) -> String {
        self.table.to_string()
    }
}

fn styled_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table
}

/// Summary table of a finished build.
pub fn create_build_table(report: &BuildReport) -> String {
    // Plain rows; comfy-table miscounts widths of ANSI-colored strings
    let mut builder = TableBuilder::new()
        .set_headers(vec!["Metric", "Value"])
        .add_row(metric("Index", &report.name))
        .add_row(metric("Vertices", report.vertex_count))
        .add_row(metric("Partitions", report.partitions))
        .add_row(metric("Shared vertices", report.shared_vertices))
        .add_row(metric("Medoid", report.medoid))
        .add_row(metric("Average degree", format!("{:.2}", report.average_degree)))
        .add_row(metric("Max degree", report.max_degree))
        .add_row(metric("Build time", format!("{:.2?}", report.elapsed)));

    if let Some(path) = &report.graph_path {
        builder = builder.add_row(metric("Graph file", path.display()));
    }

    builder.build()
}

fn metric(name: &str, value: impl std::fmt::Display) -> Vec<String> {
    vec![name.to_string(), value.to_string()]
}

/// Result table of one query: rank, vertex id and distance.
///
/// `recall` is shown as a footer row when present.
pub fn create_search_table(results: &[(VertexIndex, f32)], recall: Option<f64>) -> String {
    let mut table = styled_table();
    table.set_header(vec![
        Cell::new("Rank").add_attribute(Attribute::Bold),
        Cell::new("Vertex").add_attribute(Attribute::Bold),
        Cell::new("Distance").add_attribute(Attribute::Bold),
    ]);

    for (rank, (vertex, distance)) in results.iter().enumerate() {
        table.add_row(vec![
            (rank + 1).to_string(),
            vertex.to_string(),
            format!("{distance:.4}"),
        ]);
    }

    if let Some(recall) = recall {
        let color = if recall >= 0.95 { Color::Green } else { Color::Yellow };
        table.add_row(vec![
            Cell::new("Recall").add_attribute(Attribute::Bold),
            Cell::new(""),
            Cell::new(format!("{:.1}%", recall * 100.0))
                .fg(color)
                .add_attribute(Attribute::Bold),
        ]);
    }

    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_table_builder() {
        let table = TableBuilder::new()
            .set_headers(vec!["Column 1", "Column 2"])
            .add_row(vec!["Value 1".to_string(), "Value 2".to_string()])
            .build();

        assert!(table.contains("Column 1"));
        assert!(table.contains("Value 1"));
    }

    #[test]
    fn test_build_table() {
        let report = BuildReport {
            name: "docs".to_string(),
            vertex_count: 500,
            partitions: 2,
            shared_vertices: 500,
            medoid: 17,
            average_degree: 12.5,
            max_degree: 32,
            elapsed: Duration::from_millis(1500),
            graph_path: Some(PathBuf::from("/tmp/docs.graph")),
        };
        let table = create_build_table(&report);
        assert!(table.contains("12.50"));
        assert!(table.contains("docs.graph"));
    }

    #[test]
    fn test_search_table_with_recall() {
        let table = create_search_table(&[(4, 0.5), (9, 1.25)], Some(0.9));
        assert!(table.contains("1.2500"));
        assert!(table.contains("90.0%"));
    }
}
