//! Table observer for pretty-printing counters and counter files.
//!
//! [`TableObserver`] renders live [`Observable`] counters or a decoded
//! [`CounterFile`] as a table, using the `tabled` crate. Stack counter names
//! are split into their base name and a multi-line column of frames.
//!
//! # Feature Flag
//!
//! This module requires the `table` feature:
//!
//! ```toml
//! [dependencies]
//! conteggi = { version = "0.1", features = ["table"] }
//! ```
//!
//! # Examples
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use conteggi::file::CounterFile;
//! use conteggi::observers::table::{TableObserver, TableStyle};
//!
//! let file = CounterFile {
//!     meta: BTreeMap::new(),
//!     counts: BTreeMap::from([
//!         ("opened".to_string(), 3),
//!         ("parse\nread_config:4\nmain:12".to_string(), 2),
//!     ]),
//! };
//!
//! let table = TableObserver::new().with_style(TableStyle::Rounded).render_file(&file);
//! // ╭────────┬───────────────┬───────╮
//! // │ Name   │ Frames        │ Value │
//! // ├────────┼───────────────┼───────┤
//! // │ opened │               │ 3     │
//! // │ parse  │ read_config:4 │ 2     │
//! // │        │ main:12       │       │
//! // ╰────────┴───────────────┴───────╯
//! assert!(table.contains("read_config:4"));
//! ```

use tabled::settings::object::Rows;
use tabled::settings::{Remove, Style};
use tabled::{builder::Builder, Table, Tabled};

use crate::counters::Observable;
use crate::file::CounterFile;
use crate::names;

/// Available table styles for rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TableStyle {
    /// ASCII table with simple characters: +, -, |
    Ascii,
    /// Modern rounded corners (default)
    #[default]
    Rounded,
    /// Sharp corners with box-drawing characters
    Sharp,
    /// Modern style with clean lines
    Modern,
    /// GitHub-flavored Markdown table
    Markdown,
    /// No borders, just spacing
    Blank,
}

#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Frames")]
    frames: String,
    #[tabled(rename = "Value")]
    value: u64,
}

impl CounterRow {
    fn new(name: &str, value: u64) -> Self {
        let (base, frames) = names::decode(name);
        CounterRow {
            name: base.to_string(),
            frames: frames.collect::<Vec<_>>().join("\n"),
            value,
        }
    }
}

#[derive(Tabled)]
struct MetaRow<'a> {
    #[tabled(rename = "Key")]
    key: &'a str,
    #[tabled(rename = "Value")]
    value: &'a str,
}

/// An observer that renders counters as a formatted table.
///
/// Supports two rendering modes:
///
/// 1. **Standard mode**: a `Name | Frames | Value` table
/// 2. **Compact mode**: a multi-column grid of `name: value` cells, with
///    stack frames joined by ` < `
#[derive(Debug, Clone)]
pub struct TableObserver {
    style: TableStyle,
    show_header: bool,
    title: Option<String>,
    compact: bool,
    columns: usize,
}

impl Default for TableObserver {
    fn default() -> Self {
        Self {
            style: TableStyle::default(),
            show_header: true,
            title: None,
            compact: false,
            columns: 1,
        }
    }
}

impl TableObserver {
    /// Creates a new table observer with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the table style.
    pub fn with_style(mut self, style: TableStyle) -> Self {
        self.style = style;
        self
    }

    /// Sets whether to show the header row (standard mode only).
    pub fn with_header(mut self, show: bool) -> Self {
        self.show_header = show;
        self
    }

    /// Prints `title` on its own line above the table.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Enables or disables compact mode.
    pub fn compact(mut self, enabled: bool) -> Self {
        self.compact = enabled;
        self
    }

    /// Sets the number of columns in compact mode. Values less than 1 are treated as 1.
    pub fn columns(mut self, count: usize) -> Self {
        self.columns = count.max(1);
        self
    }

    fn apply_style(&self, table: &mut Table) {
        match self.style {
            TableStyle::Ascii => {
                table.with(Style::ascii());
            }
            TableStyle::Rounded => {
                table.with(Style::rounded());
            }
            TableStyle::Sharp => {
                table.with(Style::sharp());
            }
            TableStyle::Modern => {
                table.with(Style::modern());
            }
            TableStyle::Markdown => {
                table.with(Style::markdown());
            }
            TableStyle::Blank => {
                table.with(Style::blank());
            }
        }
    }

    fn titled(&self, table: Table) -> String {
        match &self.title {
            Some(title) => format!("{title}\n{table}"),
            None => table.to_string(),
        }
    }

    fn render_compact(&self, entries: Vec<(String, u64)>) -> String {
        if entries.is_empty() {
            return String::new();
        }
        let cells: Vec<String> = entries
            .iter()
            .map(|(name, value)| {
                let (base, frames) = names::decode(name);
                let mut label = base.to_string();
                for frame in frames {
                    label.push_str(" < ");
                    label.push_str(frame);
                }
                format!("{label}: {value}")
            })
            .collect();

        let cols = self.columns;
        let mut builder = Builder::default();
        for chunk in cells.chunks(cols) {
            let mut row = chunk.to_vec();
            row.resize(cols, String::new());
            builder.push_record(row);
        }

        let mut table = builder.build();
        self.apply_style(&mut table);
        self.titled(table)
    }

    fn render_standard(&self, entries: Vec<(String, u64)>) -> String {
        let rows: Vec<CounterRow> = entries
            .iter()
            .map(|(name, value)| CounterRow::new(name, *value))
            .collect();

        let mut table = Table::new(&rows);
        self.apply_style(&mut table);
        if !self.show_header {
            table.with(Remove::row(Rows::first()));
        }
        self.titled(table)
    }

    fn render_entries(&self, entries: Vec<(String, u64)>) -> String {
        if self.compact {
            self.render_compact(entries)
        } else {
            self.render_standard(entries)
        }
    }

    /// Renders live counters, in iteration order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use conteggi::config::{Config, Mode};
    /// use conteggi::counters::Observable;
    /// use conteggi::observers::table::TableObserver;
    /// use conteggi::session::Session;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let session = Session::new(Config::new("demo").with_dir(dir.path()).with_mode(Mode::Local));
    /// let requests = session.counter("requests");
    /// requests.add(42);
    ///
    /// let counters: Vec<&dyn Observable> = vec![&requests];
    /// let table = TableObserver::new().compact(true).render(counters.into_iter());
    /// assert!(table.contains("requests: 42"));
    /// ```
    pub fn render<'a>(&self, counters: impl Iterator<Item = &'a dyn Observable>) -> String {
        let entries = counters
            .map(|counter| (counter.name().to_string(), counter.value()))
            .collect();
        self.render_entries(entries)
    }

    /// Renders the counts of a counter file: plain counters first, then stacks.
    pub fn render_file(&self, file: &CounterFile) -> String {
        let entries = file
            .counters()
            .chain(file.stacks())
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        self.render_entries(entries)
    }

    /// Renders the metadata of a counter file as a `Key | Value` table.
    pub fn render_meta(&self, file: &CounterFile) -> String {
        let rows: Vec<MetaRow<'_>> = file
            .meta
            .iter()
            .map(|(key, value)| MetaRow { key, value })
            .collect();
        let mut table = Table::new(&rows);
        self.apply_style(&mut table);
        if !self.show_header {
            table.with(Remove::row(Rows::first()));
        }
        self.titled(table)
    }
}
