//! Launch argument vector.

use crate::builder::runner::is_shell;
use crate::error::{Result, SlipwayError};
use crate::image::ImageConfig;
use crate::ports::ServeEndpoint;
use std::fmt;
use std::ops::Range;
use std::path::Path;

/// The single foreground command a container runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    argv: Vec<String>,
}

impl LaunchCommand {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.first().map_or(true, |p| p.is_empty()) {
            return Err(SlipwayError::LaunchFailed { reason: "image defines no command to run".into() });
        }
        Ok(Self { argv })
    }

    /// ENTRYPOINT followed by CMD.
    pub fn from_image(config: &ImageConfig) -> Result<Self> {
        let argv: Vec<String> = config.entrypoint.iter().chain(config.cmd.iter()).cloned().collect();
        Self::new(argv)
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Script of a `sh -c '<script>'` command.
    fn script(&self) -> Option<&str> {
        match self.argv.as_slice() {
            [shell, flag, script, ..] if flag == "-c" && is_shell(shell) => Some(script),
            _ => None,
        }
    }

    /// Arguments as the runner sees them. For a shell command these are the
    /// script's words, minus operators and command names, followed by its
    /// positional parameters.
    fn words(&self) -> Vec<String> {
        match self.script() {
            Some(script) => {
                let mut words = Vec::new();
                let mut command_position = true;
                for word in script_words(script) {
                    if !word.operator && !command_position {
                        words.push(word.text);
                    }
                    command_position = word.operator;
                }
                words.extend(self.argv[3..].iter().cloned());
                words
            }
            None => self.args().to_vec(),
        }
    }

    /// The script the runner is asked to serve: the first positional argument
    /// that looks like a file name.
    pub fn entry_file(&self) -> Option<String> {
        self.words().into_iter().find(|w| looks_like_entry(w))
    }

    /// Endpoint named by the bind flags, if any.
    pub fn endpoint(&self) -> Option<ServeEndpoint> {
        ServeEndpoint::from_args(&self.words())
    }

    /// Replace any bind flags with the ones for `endpoint`. Shell commands
    /// get the flags written into the script itself.
    pub fn with_endpoint(mut self, endpoint: ServeEndpoint) -> Self {
        if let Some(script) = self.script().map(|s| rewrite_bind_flags(s, &endpoint)) {
            self.argv[2] = script;
            return self;
        }

        let program = self.argv.remove(0);
        let mut argv = vec![program];
        argv.extend(self.argv.into_iter().filter(|a| !ServeEndpoint::is_bind_flag(a)));
        argv.extend(endpoint.bind_flags());
        Self { argv }
    }
}

fn looks_like_entry(arg: &str) -> bool {
    !arg.starts_with('-') && !arg.contains(char::is_whitespace) && Path::new(arg).extension().is_some()
}

/// A word of a shell script: its byte span and its text with quotes removed.
#[derive(Debug, Clone)]
struct ScriptWord {
    span: Range<usize>,
    text: String,
    /// `;`, `&`, `|`, `&&` or `||` outside quotes
    operator: bool,
}

/// Split a script into words the way `sh` would, without expanding anything.
fn script_words(script: &str) -> Vec<ScriptWord> {
    fn flush(words: &mut Vec<ScriptWord>, current: &mut Option<(usize, String)>, end: usize) {
        if let Some((start, text)) = current.take() {
            words.push(ScriptWord { span: start..end, text, operator: false });
        }
    }

    let mut words = Vec::new();
    let mut current: Option<(usize, String)> = None;
    let mut quote: Option<char> = None;
    let mut chars = script.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => {
                if let Some((_, next)) = chars.next() {
                    current.get_or_insert_with(|| (i, String::new())).1.push(next);
                }
            }
            Some(_) => current.get_or_insert_with(|| (i, String::new())).1.push(c),
            None => match c {
                '\'' | '"' => {
                    current.get_or_insert_with(|| (i, String::new()));
                    quote = Some(c);
                }
                '\\' => {
                    let word = &mut current.get_or_insert_with(|| (i, String::new())).1;
                    if let Some((_, next)) = chars.next() {
                        word.push(next);
                    }
                }
                ';' | '&' | '|' => {
                    flush(&mut words, &mut current, i);
                    let mut text = c.to_string();
                    let mut end = i + 1;
                    if c != ';' {
                        if let Some(&(j, next)) = chars.peek() {
                            if next == c {
                                text.push(next);
                                end = j + 1;
                                chars.next();
                            }
                        }
                    }
                    words.push(ScriptWord { span: i..end, text, operator: true });
                }
                c if c.is_whitespace() => flush(&mut words, &mut current, i),
                c => current.get_or_insert_with(|| (i, String::new())).1.push(c),
            },
        }
    }
    flush(&mut words, &mut current, script.len());

    words
}

/// `script` with its bind flags replaced by `endpoint`'s. Without existing
/// flags, they go after the simple command that names the entry file, or
/// the last one.
fn rewrite_bind_flags(script: &str, endpoint: &ServeEndpoint) -> String {
    let words = script_words(script);
    let flags = endpoint.bind_flags().join(" ");

    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    let bound: Vec<&ScriptWord> = words.iter().filter(|w| !w.operator && ServeEndpoint::is_bind_flag(&w.text)).collect();
    match bound.split_first() {
        Some((first, rest)) => {
            edits.push((first.span.clone(), flags));
            edits.extend(rest.iter().map(|w| (w.span.clone(), String::new())));
        }
        None => {
            let commands: Vec<&[ScriptWord]> = words.split(|w| w.operator).filter(|c| !c.is_empty()).collect();
            let target = commands
                .iter()
                .find(|c| c.iter().skip(1).any(|w| looks_like_entry(&w.text)))
                .or(commands.last());
            let at = target.and_then(|c| c.last()).map_or(script.len(), |w| w.span.end);
            edits.push((at..at, format!(" {}", flags)));
        }
    }

    let mut out = script.to_string();
    for (span, text) in edits.into_iter().rev() {
        out.replace_range(span, &text);
    }
    out
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn dashboard_config() -> ImageConfig {
        ImageConfig {
            entrypoint: vec!["streamlit".into(), "run".into()],
            cmd: vec!["app.py".into(), "--server.port=8501".into(), "--server.address=0.0.0.0".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_from_image_joins_entrypoint_and_cmd() {
        let command = LaunchCommand::from_image(&dashboard_config()).unwrap();
        assert_eq!(command.program(), "streamlit");
        assert_eq!(command.to_string(), "streamlit run app.py --server.port=8501 --server.address=0.0.0.0");
        assert_eq!(command.entry_file().as_deref(), Some("app.py"));
        assert_eq!(command.endpoint(), Some(ServeEndpoint::default()));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let err = LaunchCommand::from_image(&ImageConfig::default()).unwrap_err();
        assert!(matches!(err, SlipwayError::LaunchFailed { .. }));
    }

    #[test]
    fn test_entry_file_skips_flags_and_scripts() {
        let command = LaunchCommand::new(vec!["sh".into(), "-c".into(), "exit 3".into()]).unwrap();
        assert_eq!(command.entry_file(), None);

        let command =
            LaunchCommand::new(vec!["python".into(), "-m".into(), "streamlit".into(), "run".into(), "pages/home.py".into()])
                .unwrap();
        assert_eq!(command.entry_file().as_deref(), Some("pages/home.py"));
    }

    #[test]
    fn test_with_endpoint_replaces_bind_flags() {
        let command = LaunchCommand::from_image(&dashboard_config()).unwrap();
        let endpoint = ServeEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let command = command.with_endpoint(endpoint);

        assert_eq!(
            command.argv(),
            &["streamlit", "run", "app.py", "--server.port=9000", "--server.address=127.0.0.1"]
        );
        assert_eq!(command.endpoint(), Some(endpoint));
    }

    #[test]
    fn test_shell_command_carries_flags_in_script() {
        let command = LaunchCommand::new(vec![
            "/bin/sh".into(),
            "-c".into(),
            "streamlit run app.py --server.port=8501".into(),
        ])
        .unwrap();
        assert_eq!(command.entry_file().as_deref(), Some("app.py"));
        assert_eq!(command.endpoint().map(|e| e.port), Some(8501));

        let endpoint = ServeEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let command = command.with_endpoint(endpoint);
        assert_eq!(
            command.argv(),
            &["/bin/sh", "-c", "streamlit run app.py --server.port=9000 --server.address=127.0.0.1"]
        );
        assert_eq!(command.endpoint(), Some(endpoint));
    }

    #[test]
    fn test_shell_flags_follow_the_entry_command() {
        let command = LaunchCommand::new(vec![
            "sh".into(),
            "-c".into(),
            "cd /srv && exec streamlit run 'app.py'; echo 'stopped  now'".into(),
        ])
        .unwrap();
        assert_eq!(command.entry_file().as_deref(), Some("app.py"));
        assert_eq!(command.endpoint(), None);

        let command = command.with_endpoint(ServeEndpoint::default());
        assert_eq!(
            command.argv()[2],
            "cd /srv && exec streamlit run 'app.py' --server.port=8501 --server.address=0.0.0.0; echo 'stopped  now'"
        );
    }

    #[test]
    fn test_shell_positional_arguments_count_as_entries() {
        let command =
            LaunchCommand::new(vec!["sh".into(), "-c".into(), "touch /tmp/started".into(), "main.py".into()]).unwrap();
        assert_eq!(command.entry_file().as_deref(), Some("main.py"));
    }
}
