/// Markdown flow script parser.
///
/// A script is a Markdown document in which every `## Step N: <title>`
/// heading precedes one fenced request block. Blocks are tagged
/// ` ```kest `, ` ```http ` or ` ```step `; other fences are prose and
/// are ignored.
///
/// # Format
///
/// ````markdown
/// # User auth flow
///
/// ## Step 1: register
///
/// ```kest
/// POST /register
/// Content-Type: application/json
///
/// {"username": "user_{{$randomInt}}", "password": "secret"}
///
/// [Captures]
/// username: data.username
///
/// [Asserts]
/// status == 201
/// duration < 2s
///
/// [Options]
/// retry: 2
/// timeout: 5s
/// ```
/// ````
///
/// Parsing runs in two stages: [`extract_blocks`] finds headings and
/// request fences, then [`parse_block`] applies the request grammar
/// inside each block.
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::assertion::{self, Assertion};
use crate::capture;
use crate::error::{ParseError, ParseErrorKind};
use crate::model::{Capture, HttpMethod, Scenario, ScenarioKind, Step, StepOptions};

static STEP_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^##\s+step\s+(\d+)\s*[:.\-]?\s*(.*)$")
        .expect("failed to compile step heading regex")
});

/// Info strings that mark a request block.
const REQUEST_FENCE_TAGS: &[&str] = &["kest", "http", "step"];

/// Stage-one output: one request block and where it came from.
#[derive(Debug, Clone)]
pub struct RequestBlock {
    /// Number from the `## Step N` heading, or one past the highest
    /// number seen so far.
    pub number: u32,
    pub title: Option<String>,
    /// 1-based line of the opening fence.
    pub line: usize,
    /// Block content with 1-based source line numbers.
    pub lines: Vec<(usize, String)>,
}

impl RequestBlock {
    fn label(&self) -> String {
        match &self.title {
            Some(title) if !title.is_empty() => format!("Step {}: {title}", self.number),
            _ => format!("Step {}", self.number),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Headers,
    Body,
    Captures,
    Asserts,
    Options,
}

impl Section {
    fn marker(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "[captures]" => Some(Section::Captures),
            "[asserts]" | "[assertions]" => Some(Section::Asserts),
            "[options]" => Some(Section::Options),
            _ => None,
        }
    }
}

/// Parse a Markdown flow script into a [`Scenario`].
///
/// `name_hint` (usually the file stem) names the scenario when the
/// document has no `# ` title.
pub fn parse_script(input: &str, name_hint: Option<&str>) -> Result<Scenario, ParseError> {
    let blocks = extract_blocks(input)?;
    if blocks.is_empty() {
        return Err(ParseError::new(ParseErrorKind::NoSteps));
    }

    let mut steps = blocks
        .iter()
        .map(parse_block)
        .collect::<Result<Vec<_>, _>>()?;
    steps.sort_by_key(|s| s.sort_order);

    let mut seen = HashSet::new();
    for step in &steps {
        if !seen.insert(step.id.as_str()) {
            return Err(ParseError::in_step(
                step.name.clone(),
                ParseErrorKind::DuplicateStepId(step.id.clone()),
            ));
        }
    }

    let name = document_title(input)
        .or_else(|| name_hint.map(str::to_string))
        .unwrap_or_else(|| "scenario".to_string());

    Ok(Scenario {
        id: slugify(&name),
        name,
        source: None,
        kind: ScenarioKind::Script { steps },
    })
}

/// Stage one: find request fences and the step headings above them.
///
/// An unterminated request fence is an error; an unterminated prose
/// fence swallows the rest of the document, as in any Markdown
/// renderer.
pub fn extract_blocks(input: &str) -> Result<Vec<RequestBlock>, ParseError> {
    let mut blocks = Vec::new();
    let mut heading: Option<(u32, String)> = None;
    let mut highest = 0u32;
    let mut current: Option<RequestBlock> = None;
    let mut in_prose_fence = false;

    for (idx, line) in input.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();

        if let Some(block) = current.as_mut() {
            if trimmed == "```" {
                if let Some(done) = current.take() {
                    blocks.push(done);
                }
            } else {
                block.lines.push((line_no, line.to_string()));
            }
            continue;
        }

        if in_prose_fence {
            if trimmed == "```" {
                in_prose_fence = false;
            }
            continue;
        }

        if let Some(caps) = STEP_HEADING_RE.captures(trimmed) {
            let number = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0);
            let title = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            heading = Some((number, title));
            continue;
        }

        if let Some(info) = trimmed.strip_prefix("```") {
            let tag = info.trim().to_ascii_lowercase();
            if REQUEST_FENCE_TAGS.contains(&tag.as_str()) {
                let (number, title) = match heading.take() {
                    Some((number, title)) => (number, Some(title)),
                    None => (highest.saturating_add(1), None),
                };
                highest = highest.max(number);
                current = Some(RequestBlock {
                    number,
                    title,
                    line: line_no,
                    lines: Vec::new(),
                });
            } else {
                in_prose_fence = true;
            }
        }
    }

    if let Some(block) = current {
        return Err(
            ParseError::in_step(block.label(), ParseErrorKind::UnterminatedBlock)
                .at_line(block.line),
        );
    }

    Ok(blocks)
}

/// Stage two: apply the request grammar to one block.
pub fn parse_block(block: &RequestBlock) -> Result<Step, ParseError> {
    let label = block.label();
    let fail = |line: usize, kind: ParseErrorKind| {
        ParseError::in_step(label.clone(), kind).at_line(line)
    };

    let mut lines = block.lines.iter().filter(|(_, l)| {
        let t = l.trim();
        !t.is_empty() && !t.starts_with('#')
    });
    let Some((request_line_no, request_line)) = lines.next() else {
        return Err(fail(block.line, ParseErrorKind::MissingRequestLine));
    };
    let (method, url) = parse_request_line(request_line)
        .map_err(|kind| fail(*request_line_no, kind))?;

    let mut headers = BTreeMap::new();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut captures = Vec::new();
    let mut asserts = Vec::new();
    let mut options = StepOptions::default();
    let mut explicit_id = None;

    let mut section = Section::Headers;
    let mut past_request_line = false;

    for (line_no, line) in &block.lines {
        if !past_request_line {
            past_request_line = line_no == request_line_no;
            continue;
        }
        if let Some(next) = Section::marker(line) {
            section = next;
            continue;
        }
        let trimmed = line.trim();

        match section {
            Section::Headers => {
                if trimmed.is_empty() {
                    section = Section::Body;
                } else if !trimmed.starts_with('#') {
                    let (name, value) = split_pair(trimmed)
                        .ok_or_else(|| fail(*line_no, ParseErrorKind::InvalidHeader(trimmed.to_string())))?;
                    headers.insert(name.to_string(), value.to_string());
                }
            }
            Section::Body => body_lines.push(line),
            Section::Captures => {
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                captures.push(parse_capture(trimmed).map_err(|kind| fail(*line_no, kind))?);
            }
            Section::Asserts => {
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                let assertion = Assertion::parse(trimmed).map_err(|reason| {
                    fail(
                        *line_no,
                        ParseErrorKind::InvalidAssertion(format!("{trimmed}: {reason}")),
                    )
                })?;
                asserts.push(assertion);
            }
            Section::Options => {
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                if let Some(id) = apply_option(&mut options, trimmed)
                    .map_err(|kind| fail(*line_no, kind))?
                {
                    explicit_id = Some(id);
                }
            }
        }
    }

    let body = body_lines.join("\n").trim().to_string();

    let mut step = Step::new(
        explicit_id.unwrap_or_else(|| format!("step-{}", block.number)),
        method,
        url,
    );
    step.name = label;
    step.headers = headers;
    step.body = (!body.is_empty()).then_some(body);
    step.captures = captures;
    step.asserts = asserts;
    step.sort_order = block.number;
    step.options = options;
    Ok(step)
}

fn parse_request_line(line: &str) -> Result<(HttpMethod, String), ParseErrorKind> {
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or(ParseErrorKind::MissingRequestLine)?;
    let method: HttpMethod = method.parse()?;
    let url = parts.next().ok_or(ParseErrorKind::EmptyUrl)?;
    // A trailing `HTTP/1.1` is tolerated; anything else is not.
    match parts.next() {
        None => {}
        Some(version) if version.to_ascii_uppercase().starts_with("HTTP/") => {}
        Some(_) => return Err(ParseErrorKind::Malformed(format!("unexpected text in request line '{line}'"))),
    }
    Ok((method, url.to_string()))
}

fn parse_capture(line: &str) -> Result<Capture, ParseErrorKind> {
    let (name, path) =
        split_pair(line).ok_or_else(|| ParseErrorKind::InvalidCapture(line.to_string()))?;
    capture::validate(name, path)?;
    Ok(Capture {
        name: name.to_string(),
        path: path.to_string(),
    })
}

/// Apply one `key: value` option. Returns the explicit step id when
/// the line sets one.
fn apply_option(options: &mut StepOptions, line: &str) -> Result<Option<String>, ParseErrorKind> {
    let invalid = || ParseErrorKind::InvalidOption(line.to_string());
    let (key, value) = split_pair(line).ok_or_else(invalid)?;

    match key.to_ascii_lowercase().as_str() {
        "id" => {
            if value.is_empty() {
                return Err(invalid());
            }
            return Ok(Some(value.to_string()));
        }
        "timeout" => {
            let ms = assertion::parse_duration_ms(value).ok_or_else(invalid)?;
            options.timeout_ms = Some(ms as u64);
        }
        "retry" => options.retry = value.parse().map_err(|_| invalid())?,
        "retry_wait" | "retry-wait" => {
            let ms = assertion::parse_duration_ms(value).ok_or_else(invalid)?;
            options.retry_wait_ms = ms as u64;
        }
        _ => return Err(invalid()),
    }
    Ok(None)
}

/// Split `name: value` at the first colon, trimming both sides.
fn split_pair(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((name, value.trim()))
}

fn document_title(input: &str) -> Option<String> {
    let mut in_fence = false;
    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(title) = trimmed.strip_prefix("# ") {
            let title = title.trim();
            if !title.is_empty() {
                return Some(title.to_string());
            }
        }
    }
    None
}

/// Lowercase, underscore-separated identifier derived from a name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if (ch.is_whitespace() || matches!(ch, '-' | '_' | '.'))
            && !slug.ends_with('_')
        {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}
