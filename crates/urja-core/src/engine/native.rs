//! Built-in engine.
//!
//! Performs the line-preserving subset of compilation that needs no parser:
//! define replacement, erasure of type-only TypeScript declarations, a
//! delimiter balance check, line-level minification and source maps. It
//! does not link modules, so import statements reach the output unchanged.

use super::sourcemap::{external_comment, inline_comment, line_map_json};
use super::{
    BundleInput, BundleOutput, BundleRequest, BundleTarget, Engine, EngineError, Loader, Metafile,
    OutputMeta, SourceMapKind, TransformOptions, TransformOutput,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The default engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEngine;

impl NativeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// One module to bundle.
pub(super) struct Entry {
    pub(super) name: String,
    pub(super) sourcefile: String,
    pub(super) contents: String,
}

#[async_trait]
impl Engine for NativeEngine {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn transform(
        &self,
        source: &str,
        options: &TransformOptions,
    ) -> Result<TransformOutput, EngineError> {
        if options.loader == Loader::Css {
            return Ok(TransformOutput {
                code: source.to_string(),
                map: None,
            });
        }

        let code = if options.loader.is_typescript() {
            strip_type_only(source)
        } else {
            source.to_string()
        };
        check_syntax(&code, options.loader.is_jsx()).map_err(|message| EngineError::Transform {
            file: options.filename.clone(),
            message,
        })?;

        let lines: Vec<usize> = (0..line_count(&code)).collect();
        match options.sourcemap {
            SourceMapKind::None => Ok(TransformOutput { code, map: None }),
            SourceMapKind::Inline => {
                let map = line_map_json(&options.filename, source, &lines);
                Ok(TransformOutput {
                    code: format!("{}\n{}", code.trim_end_matches('\n'), inline_comment(&map)),
                    map: None,
                })
            }
            SourceMapKind::External => {
                let map = line_map_json(&options.filename, source, &lines);
                let map_file = format!("{}.map", file_name(&options.filename));
                Ok(TransformOutput {
                    code: format!(
                        "{}\n{}",
                        code.trim_end_matches('\n'),
                        external_comment(&map_file)
                    ),
                    map: Some(map),
                })
            }
        }
    }

    async fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, EngineError> {
        let entries = load_entries(&request.input).await?;
        let mut output = BundleOutput::default();
        let mut metafile = Metafile::default();

        for (out, entry) in plan_targets(request, entries)? {
            let is_css = Loader::from_path(Path::new(&entry.sourcefile)) == Some(Loader::Css);
            let (code, lines) = build_one(&entry, request, is_css)?;
            let map = (request.sourcemap && !is_css)
                .then(|| line_map_json(&entry.sourcefile, &entry.contents, &lines));
            emit(self.name(), &out, code, map, &mut output, &mut metafile).await?;
        }

        if request.metafile {
            output.metafile = Some(metafile);
        }
        Ok(output)
    }
}

/// Output path of every entry.
pub(super) fn plan_targets(
    request: &BundleRequest,
    entries: Vec<Entry>,
) -> Result<Vec<(PathBuf, Entry)>, EngineError> {
    match &request.output {
        BundleTarget::Outfile(path) => {
            if entries.len() != 1 {
                return Err(EngineError::Bundle {
                    message: format!(
                        "An outfile requires exactly one entry point, got {}",
                        entries.len()
                    ),
                });
            }
            Ok(entries.into_iter().map(|e| (path.clone(), e)).collect())
        }
        BundleTarget::Outdir(dir) => Ok(entries
            .into_iter()
            .map(|e| {
                let ext = if Loader::from_path(Path::new(&e.sourcefile)) == Some(Loader::Css) {
                    "css"
                } else {
                    "js"
                };
                (dir.join(format!("{}.{ext}", e.name)), e)
            })
            .collect()),
    }
}

/// Write `code` to `out`, plus `map` beside it when given, and record both.
pub(super) async fn emit(
    engine: &str,
    out: &Path,
    mut code: String,
    map: Option<String>,
    output: &mut BundleOutput,
    metafile: &mut Metafile,
) -> Result<(), EngineError> {
    let mut written = Vec::with_capacity(2);
    if let Some(map) = map {
        let map_path = PathBuf::from(format!("{}.map", out.display()));
        code.push('\n');
        code.push_str(&external_comment(&file_name(&map_path.to_string_lossy())));
        write_output(&map_path, map.as_bytes()).await?;
        written.push((map_path, map.len()));
    }
    write_output(out, code.as_bytes()).await?;
    written.insert(0, (out.to_path_buf(), code.len()));

    for (path, bytes) in written {
        debug!(engine, out = %path.display(), bytes, "wrote output");
        metafile.outputs.insert(
            path.display().to_string(),
            OutputMeta {
                bytes: bytes as u64,
            },
        );
        output.files.push(path);
    }
    Ok(())
}

pub(super) async fn load_entries(input: &BundleInput) -> Result<Vec<Entry>, EngineError> {
    match input {
        BundleInput::EntryPoints(points) => {
            let mut entries = Vec::with_capacity(points.len());
            for (name, path) in points {
                let contents =
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|e| EngineError::Bundle {
                            message: format!("Could not read entry {}: {e}", path.display()),
                        })?;
                entries.push(Entry {
                    name: name.clone(),
                    sourcefile: path.display().to_string(),
                    contents,
                });
            }
            Ok(entries)
        }
        BundleInput::Stdin {
            contents,
            sourcefile,
            ..
        } => {
            let name = Path::new(sourcefile)
                .file_stem()
                .map_or_else(|| "stdin".to_string(), |s| s.to_string_lossy().into_owned());
            Ok(vec![Entry {
                name,
                sourcefile: sourcefile.clone(),
                contents: contents.clone(),
            }])
        }
    }
}

fn build_one(
    entry: &Entry,
    request: &BundleRequest,
    is_css: bool,
) -> Result<(String, Vec<usize>), EngineError> {
    if is_css {
        let lines = (0..line_count(&entry.contents)).collect();
        return Ok((entry.contents.clone(), lines));
    }

    let loader = Loader::from_path(Path::new(&entry.sourcefile));
    let mut code = apply_defines(&entry.contents, &request.define);
    if loader.is_some_and(|l| l.is_typescript()) {
        code = strip_type_only(&code);
    }
    let markup = loader.is_some_and(|l| l.is_jsx());
    check_syntax(&code, markup).map_err(|message| EngineError::Bundle {
        message: format!("{}: {message}", entry.sourcefile),
    })?;

    if request.minify {
        Ok(minify_lines(&code))
    } else {
        let lines = (0..line_count(&code)).collect();
        Ok((code, lines))
    }
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

pub(super) fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |n| n.to_string_lossy().into_owned())
}

fn line_count(code: &str) -> usize {
    code.lines().count().max(1)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Replace whole-expression occurrences of each define key.
pub(super) fn apply_defines(source: &str, defines: &BTreeMap<String, String>) -> String {
    let mut code = source.to_string();
    for (key, value) in defines {
        let mut out = String::with_capacity(code.len());
        let mut last = 0;
        for (idx, _) in code.match_indices(key.as_str()) {
            if idx < last {
                continue;
            }
            let before = code[..idx].chars().next_back();
            let after = code[idx + key.len()..].chars().next();
            let bounded_before = before.map_or(true, |c| !is_ident_char(c) && c != '.');
            let bounded_after = after.map_or(true, |c| !is_ident_char(c));
            if bounded_before && bounded_after {
                out.push_str(&code[last..idx]);
                out.push_str(value);
                last = idx + key.len();
            }
        }
        out.push_str(&code[last..]);
        code = out;
    }
    code
}

fn starts_type_only(line: &str) -> bool {
    const PREFIXES: [&str; 6] = [
        "import type ",
        "export type ",
        "export interface ",
        "interface ",
        "declare ",
        "export declare ",
    ];
    if PREFIXES.iter().any(|p| line.starts_with(p)) {
        return true;
    }
    // `type Foo = ...` but not an assignment to a variable named `type`
    line.strip_prefix("type ")
        .is_some_and(|rest| rest.trim_start().starts_with(|c: char| is_ident_char(c)))
}

fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    for c in line.chars() {
        match c {
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

/// Blank out type-only declarations, keeping every line in place.
fn strip_type_only(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut depth = 0i32;
    let mut open_statement = false;

    for line in source.split_inclusive('\n') {
        let newline = if line.ends_with('\n') { "\n" } else { "" };
        let trimmed = line.trim();

        if depth > 0 || open_statement {
            depth += brace_delta(trimmed);
            if depth <= 0 {
                depth = 0;
                open_statement = !(trimmed.ends_with(';') || trimmed.ends_with('}'));
            }
            out.push_str(newline);
            continue;
        }

        if starts_type_only(trimmed) {
            depth = brace_delta(trimmed).max(0);
            open_statement = depth == 0 && !(trimmed.ends_with(';') || trimmed.ends_with('}'));
            out.push_str(newline);
            continue;
        }

        out.push_str(line);
    }
    out
}

/// Drop blank lines and line comments; returns the code and its line map.
fn minify_lines(source: &str) -> (String, Vec<usize>) {
    let mut kept = Vec::new();
    let mut lines = Vec::new();
    for (i, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || (trimmed.starts_with("//") && !trimmed.starts_with("//#")) {
            continue;
        }
        kept.push(trimmed);
        lines.push(i);
    }
    if lines.is_empty() {
        lines.push(0);
    }
    (kept.join("\n"), lines)
}

fn regex_allowed(prev: Option<char>) -> bool {
    prev.map_or(true, |c| "(,=:[!&|?{};+-*%<>~^".contains(c))
}

/// Whether a `<` after `prev` (and the word `word`) opens JSX markup.
fn opens_markup(prev: Option<char>, word: &str, next: Option<char>) -> bool {
    let tag_start = next.is_some_and(|c| c.is_ascii_alphabetic() || c == '>');
    let expression_start = match prev {
        None => true,
        Some(c) if is_ident_char(c) => matches!(word, "return" | "yield" | "default" | "await"),
        Some(c) => "(,=:[!&|?{};>".contains(c),
    };
    tag_start && expression_start
}

/// Check that brackets are balanced outside strings, comments and regexes.
///
/// With `reject_markup`, JSX markup is an error as well: this engine has no
/// JSX transform.
fn check_syntax(source: &str, reject_markup: bool) -> Result<(), String> {
    let chars: Vec<char> = source.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut prev: Option<char> = None;
    let mut prev_raw: Option<char> = None;
    let mut word = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("Unterminated comment starting at line {start}")),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 1;
                            break;
                        }
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            '\'' | '"' => {
                let start = line;
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err(format!("Unterminated string literal at line {start}"))
                        }
                        Some('\\') => i += 1,
                        Some(&q) if q == c => break,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            '`' => {
                let start = line;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(format!("Unterminated template literal at line {start}"))
                        }
                        Some('\\') => i += 1,
                        Some('`') => break,
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            '/' if regex_allowed(prev) => {
                let mut j = i + 1;
                let mut in_class = false;
                while let Some(&r) = chars.get(j) {
                    match r {
                        '\n' => break,
                        '\\' => j += 1,
                        '[' => in_class = true,
                        ']' => in_class = false,
                        '/' if !in_class => break,
                        _ => {}
                    }
                    j += 1;
                }
                if chars.get(j) == Some(&'/') {
                    i = j;
                }
            }
            '<' if reject_markup && opens_markup(prev, &word, next) => {
                return Err(format!(
                    "JSX markup at line {line} needs a JSX-capable engine (build with the `swc` feature)"
                ));
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "Unexpected \"{c}\" at line {line}, \"{open}\" opened at line {open_line} is still open"
                        ))
                    }
                    None => return Err(format!("Unexpected \"{c}\" at line {line}")),
                }
            }
            _ => {}
        }
        if is_ident_char(c) {
            if !prev_raw.is_some_and(is_ident_char) {
                word.clear();
            }
            word.push(c);
        } else if !c.is_whitespace() {
            word.clear();
        }
        prev_raw = Some(c);
        if !c.is_whitespace() {
            prev = Some(chars.get(i).copied().unwrap_or(c));
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err(format!(
            "Expected a match for \"{open}\" opened at line {open_line}"
        )),
        None => Ok(()),
    }
}
