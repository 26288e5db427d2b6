//! Field tag parsing and property name validation.

/// Options carried by a field tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TagOptions {
    pub noindex: bool,
    pub flatten: bool,
    pub omitempty: bool,
}

/// A parsed field tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParsedTag {
    /// `"-"`: the field does not take part in the codec.
    Skip,
    Keep {
        name: Option<String>,
        options: TagOptions,
    },
}

/// Parses a tag of the form `"name,opt,opt"`.
pub(crate) fn parse_tag(tag: &str) -> Result<ParsedTag, String> {
    let tag = tag.trim();
    if tag == "-" {
        return Ok(ParsedTag::Skip);
    }
    let mut parts = tag.split(',');
    let name = parts.next().map(str::trim).unwrap_or_default();
    let mut options = TagOptions::default();
    for option in parts {
        match option.trim() {
            "noindex" => options.noindex = true,
            "flatten" => options.flatten = true,
            "omitempty" => options.omitempty = true,
            "" => {}
            other => return Err(format!("unknown tag option {other:?}")),
        }
    }
    Ok(ParsedTag::Keep {
        name: (!name.is_empty()).then(|| name.to_string()),
        options,
    })
}

/// Returns true when `name` is one or more identifiers joined by dots.
pub(crate) fn valid_property_name(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(valid_identifier)
}

fn valid_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}
