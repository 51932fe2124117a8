//! Recipe parser for the Slipway build system.
//!
//! Recipes use Dockerfile syntax restricted to a single stage. Supports:
//! - FROM, WORKDIR, COPY, RUN, ENV, ARG, LABEL, EXPOSE, CMD, ENTRYPOINT
//! - Line continuations and full-line comments
//! - ARG/ENV variable substitution (`$VAR`, `${VAR}`, `${VAR:-default}`)
//! - Shell and exec (JSON array) command forms

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// A parsed single-stage recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    /// Base runtime reference from FROM (after substitution)
    pub base: String,
    /// Instructions in order, starting with FROM
    pub instructions: Vec<Instruction>,
}

/// A single recipe instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// FROM [--platform=p] image
    From { image: String, platform: Option<String> },

    /// RUN command
    Run { command: RunCommand },

    /// COPY [--chown=u:g] src... dest
    Copy { sources: Vec<String>, destination: String, chown: Option<String> },

    /// ENV key=value... (order preserved)
    Env { vars: Vec<(String, String)> },

    /// ARG name[=default], with the value resolved against build args
    Arg { name: String, value: Option<String> },

    /// LABEL key=value...
    Label { labels: Vec<(String, String)> },

    /// EXPOSE port[/protocol]...
    Expose { ports: Vec<PortSpec> },

    /// WORKDIR /path
    Workdir { path: String },

    /// ENTRYPOINT ["exec", "form"] or ENTRYPOINT command
    Entrypoint { command: RunCommand },

    /// CMD ["exec", "form"] or CMD command
    Cmd { command: RunCommand },
}

/// RUN/CMD/ENTRYPOINT command format.
#[derive(Debug, Clone, PartialEq)]
pub enum RunCommand {
    /// Shell form: RUN pip install -r requirements.txt
    Shell(String),
    /// Exec form: CMD ["streamlit", "run", "app.py"]
    Exec(Vec<String>),
}

impl RunCommand {
    /// Argument vector as the process will receive it.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            RunCommand::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            RunCommand::Exec(args) => args.clone(),
        }
    }

    /// Flat text used for matching (lint, role detection).
    pub fn text(&self) -> String {
        match self {
            RunCommand::Shell(s) => s.clone(),
            RunCommand::Exec(args) => args.join(" "),
        }
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunCommand::Shell(s) => write!(f, "{}", s),
            RunCommand::Exec(args) => {
                let json = serde_json::to_string(args).map_err(|_| fmt::Error)?;
                write!(f, "{}", json.replace("\",\"", "\", \""))
            }
        }
    }
}

/// Port specification for EXPOSE instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.protocol {
            Protocol::Tcp => write!(f, "{}/tcp", self.port),
            Protocol::Udp => write!(f, "{}/udp", self.port),
        }
    }
}

impl fmt::Display for Instruction {
    /// Canonical recipe text. Cache keys hash this form, so it must be stable.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Instruction::From { image, platform: Some(p) } => write!(f, "FROM --platform={} {}", p, image),
            Instruction::From { image, platform: None } => write!(f, "FROM {}", image),
            Instruction::Run { command } => write!(f, "RUN {}", command),
            Instruction::Copy { sources, destination, chown } => {
                write!(f, "COPY ")?;
                if let Some(chown) = chown {
                    write!(f, "--chown={} ", chown)?;
                }
                write!(f, "{} {}", sources.join(" "), destination)
            }
            Instruction::Env { vars } => write!(f, "ENV {}", join_pairs(vars)),
            Instruction::Arg { name, value: Some(v) } => write!(f, "ARG {}={}", name, v),
            Instruction::Arg { name, value: None } => write!(f, "ARG {}", name),
            Instruction::Label { labels } => write!(f, "LABEL {}", join_pairs(labels)),
            Instruction::Expose { ports } => {
                let ports: Vec<String> = ports
                    .iter()
                    .map(|p| match p.protocol {
                        Protocol::Tcp => p.port.to_string(),
                        Protocol::Udp => p.to_string(),
                    })
                    .collect();
                write!(f, "EXPOSE {}", ports.join(" "))
            }
            Instruction::Workdir { path } => write!(f, "WORKDIR {}", path),
            Instruction::Entrypoint { command } => write!(f, "ENTRYPOINT {}", command),
            Instruction::Cmd { command } => write!(f, "CMD {}", command),
        }
    }
}

fn join_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            if v.is_empty() || v.contains(char::is_whitespace) || v.contains('"') {
                format!("{}={:?}", k, v)
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl Recipe {
    /// Render the recipe back to Dockerfile text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for instruction in &self.instructions {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        out
    }
}

/// Recipe parse error.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  Hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Parses a recipe from a string.
///
/// # Examples
/// ```
/// use slipway_core::builder::parser::parse_recipe;
///
/// let recipe = parse_recipe(r#"
/// FROM python:3.11-slim
/// WORKDIR /app
/// COPY requirements.txt .
/// RUN pip install --no-cache-dir -r requirements.txt
/// COPY . .
/// CMD ["streamlit", "run", "app.py"]
/// "#).unwrap();
///
/// assert_eq!(recipe.base, "python:3.11-slim");
/// assert_eq!(recipe.instructions.len(), 6);
/// ```
pub fn parse_recipe(content: &str) -> Result<Recipe, ParseError> {
    parse_recipe_with_args(content, &HashMap::new())
}

/// Parses a recipe, resolving ARG values against `build_args`.
pub fn parse_recipe_with_args(
    content: &str,
    build_args: &HashMap<String, String>,
) -> Result<Recipe, ParseError> {
    let mut parser = RecipeParser::new(content, build_args);
    parser.parse()
}

/// Parses a recipe from a file.
pub fn parse_recipe_file(path: &Path, build_args: &HashMap<String, String>) -> Result<Recipe, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| ParseError {
        line: 0,
        message: format!("Failed to read recipe: {}", e),
        hint: Some(format!("Check that {} exists and is readable", path.display())),
    })?;

    parse_recipe_with_args(&content, build_args)
}

/// Internal parser state.
struct RecipeParser<'a> {
    lines: Vec<(usize, String)>, // (line_number, content)
    build_args: &'a HashMap<String, String>,
    /// Active ARG/ENV values for substitution
    vars: HashMap<String, String>,
}

impl<'a> RecipeParser<'a> {
    fn new(content: &str, build_args: &'a HashMap<String, String>) -> Self {
        Self { lines: Self::preprocess(content), build_args, vars: HashMap::new() }
    }

    /// Combine continuation lines and drop full-line comments.
    fn preprocess(content: &str) -> Vec<(usize, String)> {
        let mut result = Vec::new();
        let mut current_line = String::new();
        let mut current_line_num = 0;
        let mut continuation = false;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let trimmed = line.trim();

            // Comments inside a continuation are skipped without ending it
            if trimmed.starts_with('#') {
                continue;
            }

            if trimmed.is_empty() && !continuation {
                continue;
            }

            let body = trimmed.strip_suffix('\\').unwrap_or(trimmed).trim();

            if continuation {
                if !body.is_empty() {
                    current_line.push(' ');
                    current_line.push_str(body);
                }
            } else {
                current_line_num = line_num;
                current_line = body.to_string();
            }

            continuation = trimmed.ends_with('\\');

            if !continuation && !current_line.is_empty() {
                result.push((current_line_num, std::mem::take(&mut current_line)));
            }
        }

        if !current_line.is_empty() {
            result.push((current_line_num, current_line));
        }

        result
    }

    fn parse(&mut self) -> Result<Recipe, ParseError> {
        let mut instructions = Vec::new();
        let mut base: Option<String> = None;
        let lines = std::mem::take(&mut self.lines);

        for (line_num, line) in &lines {
            let line_num = *line_num;
            let keyword = Self::extract_instruction(line);
            let args = Self::extract_args(line);
            let raw = Self::extract_raw(line);

            match keyword.as_str() {
                "ARG" => instructions.push(self.parse_arg(line_num, &args)?),
                "FROM" => {
                    if base.is_some() {
                        return Err(ParseError {
                            line: line_num,
                            message: "Multi-stage builds are not supported".into(),
                            hint: Some("A recipe has exactly one FROM instruction".into()),
                        });
                    }
                    let from = self.parse_from(line_num, &args)?;
                    if let Instruction::From { image, .. } = &from {
                        base = Some(image.clone());
                    }
                    instructions.push(from);
                }
                _ if base.is_none() => {
                    return Err(ParseError {
                        line: line_num,
                        message: format!("Expected ARG or FROM, found {}", keyword),
                        hint: Some("A recipe must start with ARG or FROM".into()),
                    });
                }
                _ => instructions.push(self.parse_instruction(line_num, &keyword, &args, raw)?),
            }
        }

        let base = base.ok_or_else(|| ParseError {
            line: 1,
            message: "Recipe must contain a FROM instruction".into(),
            hint: None,
        })?;

        // ARGs before FROM only feed substitution; keep just the stage body
        let from_pos = instructions
            .iter()
            .position(|i| matches!(i, Instruction::From { .. }))
            .unwrap_or(0);
        let instructions = instructions.split_off(from_pos);

        Ok(Recipe { base, instructions })
    }

    fn parse_instruction(
        &mut self,
        line_num: usize,
        keyword: &str,
        args: &[String],
        raw: &str,
    ) -> Result<Instruction, ParseError> {
        match keyword {
            "RUN" => self.parse_run(line_num, raw),
            "COPY" => self.parse_copy(line_num, args),
            "ENV" => self.parse_env(line_num, args),
            "LABEL" => self.parse_label(line_num, args),
            "EXPOSE" => self.parse_expose(line_num, args),
            "WORKDIR" => self.parse_workdir(line_num, args),
            "ENTRYPOINT" => self.parse_command(line_num, raw).map(|command| Instruction::Entrypoint { command }),
            "CMD" => self.parse_command(line_num, raw).map(|command| Instruction::Cmd { command }),
            "HEALTHCHECK" => Err(ParseError {
                line: line_num,
                message: "HEALTHCHECK is not supported".into(),
                hint: Some("The launched process is not health-checked or restarted".into()),
            }),
            "ADD" | "USER" | "VOLUME" | "SHELL" | "STOPSIGNAL" | "ONBUILD" => Err(ParseError {
                line: line_num,
                message: format!("Unsupported instruction: {}", keyword),
                hint: Some("Supported: FROM, ARG, WORKDIR, COPY, RUN, ENV, LABEL, EXPOSE, CMD, ENTRYPOINT".into()),
            }),
            _ => Err(ParseError { line: line_num, message: format!("Unknown instruction: {}", keyword), hint: None }),
        }
    }

    fn parse_from(&mut self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        // FROM [--platform=<platform>] <image>
        let mut platform = None;
        let mut rest = args;

        if let Some(p) = args.first().and_then(|a| a.strip_prefix("--platform=")) {
            platform = Some(self.substitute(p));
            rest = &args[1..];
        }

        let image = match rest {
            [image] => self.substitute(image),
            [] => {
                return Err(ParseError {
                    line: line_num,
                    message: "FROM instruction requires an image reference".into(),
                    hint: Some("Usage: FROM <image>".into()),
                })
            }
            [_, as_kw, ..] if as_kw.eq_ignore_ascii_case("AS") => {
                return Err(ParseError {
                    line: line_num,
                    message: "Named stages are not supported".into(),
                    hint: Some("Drop the `AS <name>` suffix".into()),
                })
            }
            _ => {
                return Err(ParseError {
                    line: line_num,
                    message: format!("Unexpected arguments to FROM: {}", rest.join(" ")),
                    hint: None,
                })
            }
        };

        if image.is_empty() || image.contains('$') {
            return Err(ParseError {
                line: line_num,
                message: format!("Unresolved base image reference: {}", image),
                hint: Some("Declare the variable with ARG before FROM".into()),
            });
        }

        Ok(Instruction::From { image, platform })
    }

    fn parse_run(&self, line_num: usize, raw: &str) -> Result<Instruction, ParseError> {
        if raw.is_empty() {
            return Err(ParseError {
                line: line_num,
                message: "RUN instruction requires a command".into(),
                hint: Some("Usage: RUN <command> or RUN [\"executable\", \"arg1\"]".into()),
            });
        }

        Ok(Instruction::Run { command: Self::parse_run_command(raw) })
    }

    fn parse_command(&self, line_num: usize, raw: &str) -> Result<RunCommand, ParseError> {
        if raw.is_empty() {
            return Err(ParseError { line: line_num, message: "Command must not be empty".into(), hint: None });
        }
        Ok(Self::parse_run_command(raw))
    }

    /// JSON array form, or shell form kept exactly as written.
    fn parse_run_command(raw: &str) -> RunCommand {
        if raw.starts_with('[') {
            if let Ok(exec_args) = serde_json::from_str::<Vec<String>>(raw) {
                return RunCommand::Exec(exec_args);
            }
        }

        RunCommand::Shell(raw.to_string())
    }

    fn parse_copy(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        // COPY [--chown=<user>:<group>] <src>... <dest>
        let mut chown = None;
        let mut arg_start = 0;

        for (i, arg) in args.iter().enumerate() {
            if let Some(value) = arg.strip_prefix("--chown=") {
                chown = Some(value.to_string());
                arg_start = i + 1;
            } else if arg.starts_with("--from=") {
                return Err(ParseError {
                    line: line_num,
                    message: "COPY --from is not supported".into(),
                    hint: Some("Multi-stage builds are not supported".into()),
                });
            } else if arg.starts_with("--") {
                return Err(ParseError { line: line_num, message: format!("Unknown COPY flag: {}", arg), hint: None });
            } else {
                break;
            }
        }

        let remaining: Vec<String> = if args.get(arg_start).map(|a| a.starts_with('[')).unwrap_or(false) {
            serde_json::from_str::<Vec<String>>(&args[arg_start..].join(" ")).map_err(|_| ParseError {
                line: line_num,
                message: "Invalid JSON array for COPY".into(),
                hint: None,
            })?
        } else {
            args[arg_start..].to_vec()
        };

        let (destination, sources) = match remaining.split_last() {
            Some((dest, sources)) if !sources.is_empty() => (dest, sources),
            _ => {
                return Err(ParseError {
                    line: line_num,
                    message: "COPY requires at least source and destination".into(),
                    hint: Some("Usage: COPY <src>... <dest>".into()),
                })
            }
        };

        Ok(Instruction::Copy {
            sources: sources.iter().map(|s| self.substitute(s)).collect(),
            destination: self.substitute(destination),
            chown,
        })
    }

    fn parse_env(&mut self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        // ENV key=value... or ENV key value
        if args.is_empty() {
            return Err(ParseError {
                line: line_num,
                message: "ENV requires at least one key=value pair".into(),
                hint: None,
            });
        }

        let mut vars = Vec::new();

        if args[0].contains('=') {
            for arg in args {
                let (key, value) = arg.split_once('=').ok_or_else(|| ParseError {
                    line: line_num,
                    message: format!("Expected key=value, found {}", arg),
                    hint: None,
                })?;
                vars.push((key.to_string(), self.substitute(&unquote(value))));
            }
        } else {
            if args.len() < 2 {
                return Err(ParseError { line: line_num, message: "ENV requires a value".into(), hint: None });
            }
            vars.push((args[0].clone(), self.substitute(&unquote(&args[1..].join(" ")))));
        }

        for (key, value) in &vars {
            self.vars.insert(key.clone(), value.clone());
        }

        Ok(Instruction::Env { vars })
    }

    fn parse_arg(&mut self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        let first = args.first().ok_or_else(|| ParseError {
            line: line_num,
            message: "ARG requires a name".into(),
            hint: Some("Usage: ARG <name>[=<default>]".into()),
        })?;

        let (name, default) = match first.split_once('=') {
            Some((name, default)) => (name.to_string(), Some(unquote(default))),
            None => (first.clone(), None),
        };

        let value = self.build_args.get(&name).cloned().or(default);

        if let Some(v) = &value {
            self.vars.insert(name.clone(), v.clone());
        }

        Ok(Instruction::Arg { name, value })
    }

    fn parse_label(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        let mut labels = Vec::new();

        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| ParseError {
                line: line_num,
                message: format!("Expected key=value, found {}", arg),
                hint: None,
            })?;
            labels.push((unquote(key), self.substitute(&unquote(value))));
        }

        Ok(Instruction::Label { labels })
    }

    fn parse_expose(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        let mut ports = Vec::new();

        for arg in args {
            let arg = self.substitute(arg);
            let (port_str, protocol) = match arg.split_once('/') {
                Some((port, proto)) => (port.to_string(), proto.to_string()),
                None => (arg.clone(), "tcp".to_string()),
            };

            let port = port_str.parse::<u16>().map_err(|_| ParseError {
                line: line_num,
                message: format!("Invalid port number: {}", port_str),
                hint: None,
            })?;

            let protocol = match protocol.to_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                _ => {
                    return Err(ParseError {
                        line: line_num,
                        message: format!("Unknown protocol: {}", protocol),
                        hint: Some("Protocol must be 'tcp' or 'udp'".into()),
                    })
                }
            };

            ports.push(PortSpec { port, protocol });
        }

        Ok(Instruction::Expose { ports })
    }

    fn parse_workdir(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        let path = self.substitute(&unquote(&args.join(" ")));
        if !path.starts_with('/') {
            return Err(ParseError {
                line: line_num,
                message: format!("WORKDIR must be an absolute path, found {}", path),
                hint: Some("Usage: WORKDIR /app".into()),
            });
        }
        Ok(Instruction::Workdir { path })
    }

    /// Expand `$VAR`, `${VAR}` and `${VAR:-default}` from ARG/ENV values.
    /// Unknown variables expand to the empty string.
    fn substitute(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '\\' && chars.peek() == Some(&'$') {
                out.push('$');
                chars.next();
                continue;
            }
            if c != '$' {
                out.push(c);
                continue;
            }

            if chars.peek() == Some(&'{') {
                chars.next();
                let mut expr = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    expr.push(c);
                }
                let (name, fallback) = match expr.split_once(":-") {
                    Some((name, fallback)) => (name.to_string(), Some(fallback.to_string())),
                    None => (expr, None),
                };
                match (self.vars.get(&name), fallback) {
                    (Some(v), _) if !v.is_empty() => out.push_str(v),
                    (_, Some(fallback)) => out.push_str(&fallback),
                    (Some(v), None) => out.push_str(v),
                    (None, None) => {}
                }
            } else {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    out.push('$');
                } else if let Some(v) = self.vars.get(&name) {
                    out.push_str(v);
                }
            }
        }

        out
    }

    fn extract_instruction(line: &str) -> String {
        line.split_whitespace().next().unwrap_or("").to_uppercase()
    }

    /// Everything after the keyword, untouched.
    fn extract_raw(line: &str) -> &str {
        line.trim_start()
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or("")
    }

    fn extract_args(line: &str) -> Vec<String> {
        let mut parts = line.splitn(2, char::is_whitespace);
        parts.next(); // Skip instruction

        if let Some(args_str) = parts.next() {
            Self::tokenize(args_str.trim())
        } else {
            Vec::new()
        }
    }

    /// Simple tokenizer that respects quotes and JSON arrays.
    fn tokenize(s: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_single = false;
        let mut in_json = 0;

        for c in s.chars() {
            match c {
                '"' if !in_single => {
                    in_quotes = !in_quotes;
                    current.push(c);
                }
                '\'' if !in_quotes => {
                    in_single = !in_single;
                    current.push(c);
                }
                '[' if !in_quotes && !in_single => {
                    in_json += 1;
                    current.push(c);
                }
                ']' if !in_quotes && !in_single && in_json > 0 => {
                    in_json -= 1;
                    current.push(c);
                    if in_json == 0 {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                ' ' | '\t' if !in_quotes && !in_single && in_json == 0 => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            }
        }

        if !current.is_empty() {
            tokens.push(current);
        }

        tokens
    }
}

/// Strip one layer of surrounding double quotes and unescape `\"`.
fn unquote(s: &str) -> String {
    let inner = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s);
    inner.replace("\\\"", "\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DASHBOARD: &str = r#"
FROM python:3.11-slim
WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
COPY . .
EXPOSE 8501
CMD ["streamlit", "run", "app.py", "--server.port=8501", "--server.address=0.0.0.0"]
    "#;

    #[test]
    fn test_dashboard_recipe() {
        let recipe = parse_recipe(DASHBOARD).unwrap();
        assert_eq!(recipe.base, "python:3.11-slim");
        assert_eq!(recipe.instructions.len(), 7);

        assert!(matches!(&recipe.instructions[1], Instruction::Workdir { path } if path == "/app"));
        assert!(matches!(
            &recipe.instructions[2],
            Instruction::Copy { sources, destination, .. } if sources == &["requirements.txt"] && destination == "."
        ));

        if let Instruction::Cmd { command: RunCommand::Exec(argv) } = &recipe.instructions[6] {
            assert_eq!(argv[0], "streamlit");
            assert_eq!(argv[4], "--server.address=0.0.0.0");
        } else {
            panic!("Expected exec-form CMD");
        }
    }

    #[test]
    fn test_render_is_stable() {
        let recipe = parse_recipe(DASHBOARD).unwrap();
        let rendered = recipe.render();
        let reparsed = parse_recipe(&rendered).unwrap();
        assert_eq!(recipe, reparsed);
        assert!(rendered.contains(
            "CMD [\"streamlit\", \"run\", \"app.py\", \"--server.port=8501\", \"--server.address=0.0.0.0\"]"
        ));
    }

    #[test]
    fn test_arg_substitution() {
        let recipe = parse_recipe(
            r#"
ARG PY=3.11
FROM python:${PY}-slim
ARG APP_DIR=/srv/app
WORKDIR $APP_DIR
        "#,
        )
        .unwrap();
        assert_eq!(recipe.base, "python:3.11-slim");
        assert!(matches!(&recipe.instructions[2], Instruction::Workdir { path } if path == "/srv/app"));
    }

    #[test]
    fn test_build_args_override_defaults() {
        let mut args = HashMap::new();
        args.insert("PY".to_string(), "3.12".to_string());
        let recipe = parse_recipe_with_args("ARG PY=3.11\nFROM python:${PY}-slim\n", &args).unwrap();
        assert_eq!(recipe.base, "python:3.12-slim");
    }

    #[test]
    fn test_line_continuation() {
        let recipe = parse_recipe(
            r#"
FROM python:3.11-slim
RUN pip install --no-cache-dir \
    # pinned in requirements
    -r requirements.txt
        "#,
        )
        .unwrap();
        assert_eq!(recipe.instructions.len(), 2);
        assert!(matches!(
            &recipe.instructions[1],
            Instruction::Run { command: RunCommand::Shell(s) } if s == "pip install --no-cache-dir -r requirements.txt"
        ));
    }

    #[test]
    fn test_shell_form_text_is_verbatim() {
        let recipe = parse_recipe("FROM alpine\nRUN echo 'a  b'\t\"c   d\"\nCMD streamlit run app.py  --theme.base='dark  mode'\n").unwrap();
        assert!(matches!(
            &recipe.instructions[1],
            Instruction::Run { command: RunCommand::Shell(s) } if s == "echo 'a  b'\t\"c   d\""
        ));
        assert!(matches!(
            &recipe.instructions[2],
            Instruction::Cmd { command: RunCommand::Shell(s) } if s == "streamlit run app.py  --theme.base='dark  mode'"
        ));

        let recipe = parse_recipe("FROM alpine\nCMD [\"streamlit\",   \"run\", \"app.py\"]\n").unwrap();
        assert!(matches!(
            &recipe.instructions[1],
            Instruction::Cmd { command: RunCommand::Exec(args) } if args == &["streamlit", "run", "app.py"]
        ));
    }

    #[test]
    fn test_hash_inside_command_is_not_a_comment() {
        let recipe = parse_recipe("FROM alpine\nRUN echo \"#not-a-comment\"\n").unwrap();
        assert!(matches!(
            &recipe.instructions[1],
            Instruction::Run { command: RunCommand::Shell(s) } if s.contains("#not-a-comment")
        ));
    }

    #[test]
    fn test_expose_parsing() {
        let recipe = parse_recipe("FROM alpine\nEXPOSE 8501 53/udp\n").unwrap();
        if let Instruction::Expose { ports } = &recipe.instructions[1] {
            assert_eq!(ports.len(), 2);
            assert_eq!(ports[0].port, 8501);
            assert_eq!(ports[1].protocol, Protocol::Udp);
        } else {
            panic!("Expected EXPOSE instruction");
        }
    }

    #[test]
    fn test_env_parsing_preserves_order() {
        let recipe = parse_recipe(
            r#"
FROM alpine
ENV B=2 A="one two"
ENV C value with spaces
        "#,
        )
        .unwrap();

        if let Instruction::Env { vars } = &recipe.instructions[1] {
            assert_eq!(vars[0], ("B".to_string(), "2".to_string()));
            assert_eq!(vars[1], ("A".to_string(), "one two".to_string()));
        } else {
            panic!("Expected ENV instruction");
        }

        if let Instruction::Env { vars } = &recipe.instructions[2] {
            assert_eq!(vars[0].1, "value with spaces");
        }
    }

    #[test]
    fn test_error_no_from() {
        let err = parse_recipe("RUN echo hello").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_error_multi_stage() {
        let err = parse_recipe("FROM python:3.11 AS build\n").unwrap_err();
        assert!(err.message.contains("Named stages"));

        let err = parse_recipe("FROM alpine\nFROM python:3.11\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("Multi-stage"));

        let err = parse_recipe("FROM alpine\nCOPY --from=build /out /out\n").unwrap_err();
        assert!(err.message.contains("--from"));
    }

    #[test]
    fn test_error_healthcheck_and_unknown() {
        let err = parse_recipe("FROM alpine\nHEALTHCHECK CMD curl localhost\n").unwrap_err();
        assert!(err.message.contains("HEALTHCHECK"));

        let err = parse_recipe("FROM alpine\nINVALID instruction\n").unwrap_err();
        assert!(err.message.contains("Unknown instruction"));
    }

    #[test]
    fn test_relative_workdir_rejected() {
        assert!(parse_recipe("FROM alpine\nWORKDIR app\n").is_err());
    }
}
