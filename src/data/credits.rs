//! Parser for free-text "key creatives" fields.
//!
//! Turns `"David E. Kelley (w, ep), Dean Lorey (w, ep), Bill D'Elia (d)"` into
//! one [`CreditEntry`] per person. Parsing happens in two phases:
//!
//! 1. **Segmentation** splits on commas at parenthesis depth zero, so a role
//!    list like `(w, ep)` is never torn apart.
//! 2. **Extraction** peels an optional trailing `(...)` group off each segment
//!    as the role list; the text before it is the person's name.

use crate::data::aliases::{AliasIndex, Resolution};
use crate::data::models::{CreditEntry, CreditRole, EntityType};
use crate::data::names::{collapse_whitespace, decode_html_entities};
use crate::error::MalformedCreditString;
use indexmap::IndexSet;
use tracing::{debug, warn};

/// One top-level, comma-delimited piece of a credits field.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment<'s> {
    text: &'s str,
    /// Set when parentheses in this segment do not balance.
    defect: Option<&'static str>,
}

/// Phase 1: split on commas that are not nested inside parentheses.
///
/// A stray `)` is flagged on its own segment and does not affect later
/// segments. An unclosed `(` flags the text up to the first comma after it,
/// and splitting resumes past that comma.
fn segment(raw: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut from = 0;
    while let Some(resume) = scan(raw, from, &mut segments) {
        from = resume;
    }
    segments
}

/// Split `raw[from..]` into `segments`. Returns the offset to resume from
/// when an unclosed `(` cut the scan short.
fn scan<'s>(raw: &'s str, from: usize, segments: &mut Vec<Segment<'s>>) -> Option<usize> {
    let mut depth = 0usize;
    let mut start = from;
    let mut defect = None;
    let mut opened_at = from;

    for (offset, ch) in raw[from..].char_indices() {
        let i = from + offset;
        match ch {
            '(' => {
                if depth == 0 {
                    opened_at = i;
                }
                depth += 1;
            }
            ')' if depth == 0 => defect = Some("unbalanced closing parenthesis"),
            ')' => depth -= 1,
            ',' if depth == 0 => {
                segments.push(Segment {
                    text: &raw[start..i],
                    defect: defect.take(),
                });
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth == 0 {
        segments.push(Segment {
            text: &raw[start..],
            defect,
        });
        return None;
    }

    let defect = Some("unclosed parenthesis");
    match raw[opened_at..].find(',') {
        Some(offset) => {
            let comma = opened_at + offset;
            segments.push(Segment {
                text: &raw[start..comma],
                defect,
            });
            Some(comma + 1)
        }
        None => {
            segments.push(Segment {
                text: &raw[start..],
                defect,
            });
            None
        }
    }
}

/// Phase 2: split one segment into a name and an optional raw role list.
fn extract(segment: &Segment<'_>) -> Result<(String, Option<String>), MalformedCreditString> {
    let malformed = |reason| MalformedCreditString {
        segment: segment.text.trim().to_string(),
        reason,
    };

    if let Some(reason) = segment.defect {
        return Err(malformed(reason));
    }

    let text = segment.text.trim();
    let Some(inner) = text.strip_suffix(')') else {
        if text.contains('(') {
            return Err(malformed("text after parenthesized role list"));
        }
        return Ok((clean(text), None));
    };

    // Find the '(' that opens the trailing group.
    let mut depth = 0usize;
    let mut open = None;
    for (i, ch) in inner.char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' if depth == 0 => {
                open = Some(i);
                break;
            }
            '(' => depth -= 1,
            _ => {}
        }
    }

    let open = open.ok_or_else(|| malformed("unbalanced closing parenthesis"))?;
    let roles = &inner[open + 1..];
    if roles.contains('(') || roles.contains(')') {
        return Err(malformed("nested parentheses in role list"));
    }

    Ok((clean(&inner[..open]), Some(roles.to_string())))
}

fn clean(s: &str) -> String {
    collapse_whitespace(&decode_html_entities(s))
}

/// Parses credits fields, expanding role abbreviations through an
/// [`AliasIndex`].
pub struct CreditStringParser<'a> {
    aliases: &'a AliasIndex,
}

impl<'a> CreditStringParser<'a> {
    pub fn new(aliases: &'a AliasIndex) -> Self {
        Self { aliases }
    }

    /// Parse a raw credits field.
    ///
    /// `team_order` is the 1-based position of the credit among the non-blank
    /// segments of the original field, so skipped segments still hold their
    /// place. Malformed segments are logged and skipped; segments with no name
    /// are dropped. Duplicated people are kept, deduplication is up to the
    /// caller.
    pub fn parse(&self, show_identifier: &str, raw_credits_text: &str) -> Vec<CreditEntry> {
        if raw_credits_text.trim().is_empty() {
            return Vec::new();
        }

        let mut entries = Vec::new();
        let segments = segment(raw_credits_text)
            .into_iter()
            .filter(|s| !s.text.trim().is_empty());

        for (index, seg) in segments.enumerate() {
            let (name, raw_roles) = match extract(&seg) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(show = show_identifier, error = %e, "Skipping malformed credit segment");
                    continue;
                }
            };

            if name.is_empty() {
                debug!(
                    show = show_identifier,
                    segment = seg.text.trim(),
                    "Dropping credit segment with no name"
                );
                continue;
            }

            let roles = raw_roles
                .as_deref()
                .map(|r| self.resolve_roles(r))
                .unwrap_or_default();

            entries.push(CreditEntry {
                person_name: name,
                roles,
                team_order: Some(index as u32 + 1),
            });
        }

        entries
    }

    /// Resolve each comma-separated role abbreviation, keeping unresolved ones
    /// verbatim.
    fn resolve_roles(&self, raw_roles: &str) -> IndexSet<CreditRole> {
        raw_roles
            .split(',')
            .map(clean)
            .filter(|r| !r.is_empty())
            .map(|raw| match self.aliases.resolve(&raw, EntityType::Role) {
                Resolution::Resolved(entity) => CreditRole::Canonical {
                    id: entity.id,
                    name: entity.canonical_name,
                },
                Resolution::Unresolved(_) => CreditRole::Raw { text: raw },
            })
            .collect()
    }
}
