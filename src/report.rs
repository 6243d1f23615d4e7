use std::fmt::Write as _;

use chrono::{TimeZone, Utc};

use crate::schema::PropertyDefinition;

const HEADERS: [&str; 4] = ["name", "column", "types", "first_seen"];

/// Renders property definitions as a left-aligned text table.
pub fn render_definitions(definitions: &[PropertyDefinition]) -> String {
    let rows: Vec<[String; 4]> = definitions
        .iter()
        .map(|def| {
            let types = def
                .data_types
                .iter()
                .map(|ty| ty.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let first_seen = Utc
                .timestamp_millis_opt(def.first_seen)
                .single()
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| def.first_seen.to_string());
            [def.name.clone(), def.column.clone(), types, first_seen]
        })
        .collect();

    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut output = String::new();
    let header = HEADERS.map(str::to_string);
    let separator = widths.map(|w| "-".repeat(w));
    for line in std::iter::once(&header).chain(std::iter::once(&separator)).chain(&rows) {
        let _ = writeln!(output, "{}", format_line(line, &widths));
    }
    output
}

fn format_line(cells: &[String; 4], widths: &[usize; 4]) -> String {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    line.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Scope;
    use crate::value::PropertyType;
    use std::collections::BTreeSet;

    #[test]
    fn aligns_columns_and_lists_types() {
        let defs = vec![PropertyDefinition {
            scope: Scope::Event,
            name: "pageTitle".to_string(),
            column: "p_page_title".to_string(),
            data_types: BTreeSet::from([PropertyType::Str, PropertyType::Num]),
            first_seen: 0,
        }];
        let rendered = render_definitions(&defs);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("name       column"));
        assert!(lines[2].contains("p_page_title"));
        assert!(lines[2].contains("str,num"));
        assert!(lines[2].ends_with("1970-01-01 00:00:00"));
    }
}
