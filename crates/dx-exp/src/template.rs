//! Command templates for declarative experiments.
//!
//! `{option}` expands to the binding value of `option`; `{target.name}`,
//! `{target.host}`, `{target.index}`, `{target.count}` and `{target.<key>}`
//! expand to the identity of the target the command is built for. `{{` and
//! `}}` produce literal braces.

use dx_core::errors::{DxError, ErrorInfo};

use crate::cluster::ServerSpec;
use crate::grid::{ParameterBinding, ParameterSpec};
use crate::target::TargetInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetField {
    Name,
    Host,
    Index,
    Count,
    Meta(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Target(TargetField),
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

fn syntax_error(code: &str, message: &str, source: &str) -> DxError {
    DxError::Config(ErrorInfo::new(code, message).with_context("template", source))
}

impl CommandTemplate {
    pub fn parse(source: &str) -> Result<Self, DxError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(syntax_error("template.stray_brace", "unmatched '}'", source));
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(syntax_error(
                                    "template.unclosed",
                                    "placeholder is missing its closing '}'",
                                    source,
                                ))
                            }
                            Some(c) => name.push(c),
                        }
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(syntax_error("template.empty_placeholder", "empty placeholder", source));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Self::placeholder(name, source)?);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    fn placeholder(name: &str, source: &str) -> Result<Segment, DxError> {
        let Some(field) = name.strip_prefix("target.") else {
            return Ok(Segment::Param(name.to_string()));
        };
        let field = match field {
            "" => return Err(syntax_error("template.empty_placeholder", "empty target field", source)),
            "name" => TargetField::Name,
            "host" => TargetField::Host,
            "index" => TargetField::Index,
            "count" => TargetField::Count,
            key => TargetField::Meta(key.to_string()),
        };
        Ok(Segment::Target(field))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Binding options referenced by the template, in order of appearance.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Param(name) => Some(name.as_str()),
            _ => None,
        })
    }

    fn meta_keys(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Target(TargetField::Meta(key)) => Some(key.as_str()),
            _ => None,
        })
    }

    /// Builds the command for one target. `count` is the number of targets in
    /// the fan-out.
    pub fn render(
        &self,
        binding: &ParameterBinding,
        target: &TargetInfo,
        count: usize,
    ) -> Result<String, DxError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Param(name) => {
                    let value = binding
                        .require(name)
                        .map_err(|err| err.with_context("template", self.source.clone()))?;
                    out.push_str(&value.to_string());
                }
                Segment::Target(TargetField::Name) => out.push_str(&target.name),
                Segment::Target(TargetField::Host) => out.push_str(&target.host),
                Segment::Target(TargetField::Index) => out.push_str(&target.index.to_string()),
                Segment::Target(TargetField::Count) => out.push_str(&count.to_string()),
                Segment::Target(TargetField::Meta(key)) => {
                    let value = target.meta(key).ok_or_else(|| {
                        DxError::Config(
                            ErrorInfo::new("template.unknown_meta", "target has no such metadata")
                                .with_context("key", key.clone())
                                .with_context("target", target.name.clone())
                                .with_context("template", self.source.clone()),
                        )
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    /// Checks every placeholder against the options of `spec` and the
    /// metadata of every server, without rendering anything.
    pub fn validate(&self, spec: &ParameterSpec, servers: &[ServerSpec]) -> Result<(), DxError> {
        for name in self.params() {
            if !spec.parameters().iter().any(|param| param.name == name) {
                return Err(DxError::Config(
                    ErrorInfo::new("template.unknown_option", "placeholder names no parameter option")
                        .with_context("option", name)
                        .with_context("template", self.source.clone()),
                ));
            }
        }
        for key in self.meta_keys() {
            if let Some(server) = servers.iter().find(|server| !server.meta.contains_key(key)) {
                return Err(DxError::Config(
                    ErrorInfo::new("template.unknown_meta", "target has no such metadata")
                        .with_context("key", key)
                        .with_context("target", server.name.clone())
                        .with_context("template", self.source.clone()),
                ));
            }
        }
        Ok(())
    }
}
