//! Path templating for destination folders.
//!
//! Converts [`TicketMetadata`] and a file's modification time into a
//! deterministic destination directory using a user-configured [upon]
//! template. The template syntax follows upon's Mustache-like conventions
//! (`{{ variable }}`, `{{ value|formatter }}`), extended with:
//!
//! - **`lower`**/**`upper`**: change the case of a value.
//! - **`truncate`**: truncates strings to a maximum byte length at a character
//!   boundary, usable as either `truncate(value, n)` or `{{ value|truncate: n }}`.
//!
//! # Template Variables
//!
//! | Variable   | Type            | Description                                    |
//! |------------|-----------------|------------------------------------------------|
//! | `project`  | `String`        | Redmine project name                           |
//! | `category` | `String`        | Issue category (or tracker) name               |
//! | `ticket`   | `String`        | Ticket number, as written in the file name     |
//! | `title`    | `String`        | Full ticket title                              |
//! | `subject`  | `String`        | Title without its leading `[tag]` prefixes     |
//! | `tags`     | `List<String>`  | The `[tag]` prefixes of the title              |
//! | `tag1`..`tag3` | `String`    | Individual tags, empty when absent             |
//! | `date`     | `String`        | Modification date as `YYYYMMDD`                |
//! | `year`, `month`, `day` | `String` | Zero-padded parts of that date           |
//!
//! Every value is sanitized into a single path segment before rendering, so a
//! project called `Sales/EMEA` can't create an extra directory level. Empty
//! segments (an absent `tag2`, say) disappear from the rendered path.
//!
//! # Example
//!
//! ```
//! use docket_extract::models::TicketMetadata;
//! use docket_library::PathGenerator;
//! use std::path::Path;
//! use std::time::{Duration, UNIX_EPOCH};
//!
//! let generator: PathGenerator = "{{ project }}/{{ category }}/{{ ticket }}/{{ date }}".parse().unwrap();
//! let metadata = TicketMetadata::new("4521".parse().unwrap(), "Acme", "Invoices", "Q4 run");
//! // 2024-12-17T12:00:00Z
//! let modified = UNIX_EPOCH + Duration::from_secs(1_734_436_800);
//! let path = generator.build(Path::new("/srv/docs"), &metadata, modified).unwrap();
//! assert_eq!(path, Path::new("/srv/docs/Acme/Invoices/4521/20241217"));
//! ```

use crate::error::{Error, ErrorKind, Result};
use docket_extract::models::TicketMetadata;
use docket_storage::{sanitize_segment, validate_path};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use time::{OffsetDateTime, UtcOffset};
use tracing::instrument;
use upon::{Engine, Template, Value};

/// Generates deterministic destination directories from ticket metadata and a
/// user-defined template string.
///
/// Constructed via [`FromStr`] (UTC dates) or [`new`](Self::new), both of
/// which compile the template eagerly so that syntax errors surface at
/// creation time rather than at render time.
pub struct PathGenerator {
    engine: Engine<'static>,
    template: Template<'static>,
    offset: UtcOffset,
}
impl FromStr for PathGenerator {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s, UtcOffset::UTC)
    }
}
impl PathGenerator {
    /// Compiles `layout`; dates are rendered in the given `offset`, normally
    /// the machine's local offset.
    pub fn new(layout: &str, offset: UtcOffset) -> Result<Self> {
        let mut engine = Engine::new();
        addons::configure(&mut engine);
        let template = engine.compile(layout.to_string()).or_raise(|| ErrorKind::Template)?;
        Ok(Self { engine, template, offset })
    }

    /// The destination directory for a file, below `root`.
    pub fn build(&self, root: &Path, metadata: &TicketMetadata, modified: SystemTime) -> Result<PathBuf> {
        Ok(root.join(self.render(metadata, modified)?))
    }

    /// Renders the template to a relative path. The result is normalized and
    /// validated to ensure it stays within the root it will be joined onto.
    #[instrument(skip_all, fields(ticket = %metadata.id))]
    pub fn render(&self, metadata: &TicketMetadata, modified: SystemTime) -> Result<PathBuf> {
        let path = self
            .template
            .render(&self.engine, self.parameters(metadata, modified))
            .to_string()
            .or_raise(|| ErrorKind::Template)?;
        Self::normalize(&path)
    }

    /// Splits on either separator, drops empty and `.` segments, re-sanitizes
    /// what's left (formatters like `truncate` can leave trailing dots or
    /// spaces behind) and validates the result.
    fn normalize(rendered: &str) -> Result<PathBuf> {
        let segments: Vec<String> = rendered
            .split(['/', '\\'])
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != ".")
            .map(sanitize_segment)
            .collect();
        validate_path(segments.join("/")).or_raise(|| ErrorKind::Template)
    }

    fn parameters(&self, metadata: &TicketMetadata, modified: SystemTime) -> Value {
        let date = OffsetDateTime::from(modified).to_offset(self.offset).date();
        let tag = |i: usize| metadata.tags.get(i).map(|t| sanitize_segment(t)).unwrap_or_default();
        let tags: Vec<Value> = metadata.tags.iter().map(|t| Value::from(sanitize_segment(t))).collect();
        let (year, month, day) = (date.year(), u8::from(date.month()), date.day());
        upon::value! {
            project: sanitize_segment(&metadata.project),
            category: sanitize_segment(&metadata.category),
            ticket: metadata.id.as_str(),
            title: sanitize_segment(&metadata.title),
            subject: sanitize_segment(metadata.subject()),
            tags: Value::List(tags),
            tag1: tag(0),
            tag2: tag(1),
            tag3: tag(2),
            date: format!("{year:04}{month:02}{day:02}"),
            year: format!("{year:04}"),
            month: format!("{month:02}"),
            day: format!("{day:02}"),
        }
    }
}

/// Custom [`upon`] extensions for path-safe string manipulation.
mod addons {
    use std::fmt::Write;
    use upon::{Engine, Value, fmt as upon_fmt};

    fn lower_formatter(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        match value {
            Value::String(s) => f.write_str(&s.to_lowercase())?,
            v => upon_fmt::default(f, v)?,
        };
        Ok(())
    }

    fn upper_formatter(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        match value {
            Value::String(s) => f.write_str(&s.to_uppercase())?,
            v => upon_fmt::default(f, v)?,
        };
        Ok(())
    }

    /// Truncates a string to a maximum byte length at a character boundary.
    fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> String {
        s[..s.floor_char_boundary(max_bytes)].to_string()
    }

    pub(crate) fn configure(engine: &mut Engine<'_>) {
        engine.add_formatter("lower", lower_formatter);
        engine.add_formatter("upper", upper_formatter);
        engine.add_function("truncate", truncate_to_char_boundary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_config::DEFAULT_LAYOUT;
    use rstest::rstest;
    use std::time::{Duration, UNIX_EPOCH};

    /// 2024-12-17T12:00:00Z
    const NOON_17_DEC_2024: u64 = 1_734_436_800;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn metadata(project: &str, category: &str, title: &str) -> TicketMetadata {
        TicketMetadata::new("4521".parse().unwrap(), project, category, title)
    }

    #[test]
    fn test_default_layout() {
        let generator: PathGenerator = DEFAULT_LAYOUT.parse().unwrap();
        let path = generator.render(&metadata("Acme", "Invoices", "Q4"), at(NOON_17_DEC_2024)).unwrap();
        assert_eq!(path, Path::new("Acme/Invoices/4521/20241217"));
    }

    #[test]
    fn test_same_inputs_same_path() {
        let generator: PathGenerator = DEFAULT_LAYOUT.parse().unwrap();
        let metadata = metadata("Acme Corp", "Support: Tier 2", "[X] odd/title");
        let first = generator.build(Path::new("/root"), &metadata, at(NOON_17_DEC_2024)).unwrap();
        let second = generator.build(Path::new("/root"), &metadata, at(NOON_17_DEC_2024)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Path::new("/root/Acme Corp/Support_ Tier 2/4521/20241217"));
    }

    #[rstest]
    // 20:00 UTC on the 16th is already the 17th in Sydney...
    #[case(NOON_17_DEC_2024 - 16 * 3600, 10, "20241217")]
    // ...and 02:00 UTC on the 17th is still the 16th in New York.
    #[case(NOON_17_DEC_2024 - 10 * 3600, -5, "20241216")]
    #[case(NOON_17_DEC_2024, 0, "20241217")]
    fn test_date_uses_offset(#[case] secs: u64, #[case] hours: i8, #[case] expected: &str) {
        let offset = UtcOffset::from_hms(hours, 0, 0).unwrap();
        let generator = PathGenerator::new("{{ date }}", offset).unwrap();
        let path = generator.render(&metadata("A", "B", "C"), at(secs)).unwrap();
        assert_eq!(path, Path::new(expected));
    }

    #[test]
    fn test_date_parts() {
        let generator: PathGenerator = "{{ year }}/{{ month }}/{{ day }}".parse().unwrap();
        let path = generator.render(&metadata("A", "B", "C"), at(NOON_17_DEC_2024)).unwrap();
        assert_eq!(path, Path::new("2024/12/17"));
    }

    #[test]
    fn test_values_cannot_add_levels_or_escape() {
        let generator: PathGenerator = DEFAULT_LAYOUT.parse().unwrap();
        let path = generator.render(&metadata("../../etc", "a/b\\c", "t"), at(NOON_17_DEC_2024)).unwrap();
        assert_eq!(path, Path::new(".._.._etc/a_b_c/4521/20241217"));
    }

    #[test]
    fn test_title_tags() {
        let generator: PathGenerator = "{{ tag1 }}/{{ tag2 }}/{{ tag3 }}/{{ ticket }} {{ subject }}".parse().unwrap();
        let path = generator.render(&metadata("A", "B", "[Nanya][G2128] Slow inspection"), at(0)).unwrap();
        // Missing tag3 collapses instead of leaving an empty directory level.
        assert_eq!(path, Path::new("Nanya/G2128/4521 Slow inspection"));
    }

    #[test]
    fn test_tag_loop() {
        let generator: PathGenerator = "{% for tag in tags %}{{ tag }}/{% endfor %}{{ ticket }}".parse().unwrap();
        let path = generator.render(&metadata("A", "B", "[x][y] z"), at(0)).unwrap();
        assert_eq!(path, Path::new("x/y/4521"));
    }

    #[test]
    fn test_formatters() {
        let generator: PathGenerator = "{{ project|lower }}/{{ category|upper }}/{{ title|truncate: 10 }}".parse().unwrap();
        let path = generator.render(&metadata("Acme", "Invoices", "Quarterly. invoice run"), at(0)).unwrap();
        // "Quarterly." loses its trailing dot.
        assert_eq!(path, Path::new("acme/INVOICES/Quarterly"));
    }

    #[test]
    fn test_empty_render_is_rejected() {
        let generator: PathGenerator = "{{ tag1 }}".parse().unwrap();
        let err = generator.render(&metadata("A", "B", "no tags"), at(0)).unwrap_err();
        assert_eq!(*err, ErrorKind::Template);
    }

    #[test]
    fn test_invalid_template_fails_fast() {
        assert!("{{ project".parse::<PathGenerator>().is_err());
    }

    #[test]
    fn test_unknown_variable_fails_at_render() {
        let generator: PathGenerator = "{{ nonsense }}".parse().unwrap();
        assert!(generator.render(&metadata("A", "B", "C"), at(0)).is_err());
    }
}
