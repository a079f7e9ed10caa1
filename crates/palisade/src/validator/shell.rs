//! Shell command screening.
//!
//! The command line is tokenised with a small quote-aware lexer that records
//! every construct able to run more than the single visible command
//! (separators, substitutions, expansions). Each simple command is then
//! matched against known destructive, privileged, abusive and egress idioms.

use std::sync::LazyLock;

use regex_lite::Regex;

use super::network::{HostAllowlist, screen_host, screen_url};
use super::{Finding, Screen, Severity};
use crate::action::{Action, ActionKind};

/// How deep `sh -c '...'` scripts are unpacked before giving up.
const MAX_NESTING: usize = 3;

/// Top-level directories whose deletion destroys the host.
const SYSTEM_ROOTS: &[&str] = &[
    "/bin",
    "/boot",
    "/dev",
    "/etc",
    "/home",
    "/lib",
    "/lib64",
    "/opt",
    "/proc",
    "/root",
    "/sbin",
    "/srv",
    "/sys",
    "/usr",
    "/var",
    "/Applications",
    "/Library",
    "/System",
    "/Users",
    "/private",
];

static ABUSE_PATTERNS: LazyLock<Vec<(Regex, Severity, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"\(\)\s*\{[^}]*\|[^}]*&[^}]*\}",
            Severity::Critical,
            "fork bomb: function that pipes into itself in the background",
        ),
        (
            r"\bwhile\s+(true|:|\[\s*1\s*\]|\(\(\s*1\s*\)\))",
            Severity::High,
            "unbounded `while` loop",
        ),
        (r"\buntil\s+false\b", Severity::High, "unbounded `until` loop"),
        (
            r"\bfor\s*\(\(\s*;\s*;\s*\)\)",
            Severity::High,
            "unbounded `for` loop",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, severity, reason)| {
        Regex::new(pattern).ok().map(|re| (re, severity, reason))
    })
    .collect()
});

/// A quantified group that is itself quantified, e.g. `(a+)+`.
static NESTED_QUANTIFIER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\([^()]*[+*]\)[+*{]").ok());

/// Screens `Shell` actions.
pub(super) struct ShellScreen {
    egress: HostAllowlist,
}

impl ShellScreen {
    pub(super) fn new(egress: HostAllowlist) -> Self {
        Self { egress }
    }

    fn screen_line(&self, line: &str, depth: usize, findings: &mut Vec<Finding>) {
        for (regex, severity, reason) in ABUSE_PATTERNS.iter() {
            if regex.is_match(line) {
                findings.push(Finding::deny(*severity, *reason));
            }
        }

        let lexed = lex(line);
        findings.extend(lexed.hazards.iter().map(|h| h.finding()));
        for redirect in lexed.redirects.iter().filter(|r| r.write) {
            screen_write_target(&redirect.target, findings);
        }
        for command in &lexed.commands {
            self.screen_command(command, depth, findings);
        }
    }

    fn screen_command(&self, words: &[String], depth: usize, findings: &mut Vec<Finding>) {
        for word in words {
            if word.contains("/dev/tcp/") || word.contains("/dev/udp/") {
                findings.push(Finding::deny(
                    Severity::Critical,
                    "raw socket through /dev/tcp (reverse shell idiom)",
                ));
            }
            if let Some(url) = embedded_url(word) {
                findings.extend(screen_url(url, &self.egress));
            }
            if NESTED_QUANTIFIER.as_ref().is_some_and(|re| re.is_match(word)) {
                findings.push(Finding::deny(
                    Severity::High,
                    "regular expression with nested quantifiers (catastrophic backtracking)",
                ));
            }
        }

        let Some((program, args)) = unwrap_command(words, findings) else {
            return;
        };

        match program {
            "rm" | "rmdir" | "unlink" => screen_rm(args, findings),
            "find" => screen_find(args, findings),
            "dd" => screen_dd(args, findings),
            "shred" | "wipefs" | "fdisk" | "sfdisk" | "parted" | "mkswap" => {
                findings.push(Finding::deny(
                    Severity::Critical,
                    format!("disk-destroying command `{program}`"),
                ));
            }
            p if p.starts_with("mkfs") => {
                findings.push(Finding::deny(
                    Severity::Critical,
                    format!("disk-destroying command `{program}`"),
                ));
            }
            "chmod" => {
                if args
                    .iter()
                    .any(|a| matches!(a.as_str(), "777" | "0777" | "a+rwx" | "ugo+rwx"))
                {
                    findings.push(Finding::warn(
                        Severity::Medium,
                        "chmod makes files world-writable",
                    ));
                }
                if args.iter().any(|a| a.contains("+s")) {
                    findings.push(Finding::deny(Severity::High, "chmod sets the setuid bit"));
                }
            }
            "chown" | "chgrp" => {
                findings.push(Finding::warn(
                    Severity::Medium,
                    format!("`{program}` changes file ownership"),
                ));
            }
            "shutdown" | "reboot" | "halt" | "poweroff" => {
                findings.push(Finding::warn(
                    Severity::High,
                    format!("`{program}` changes the host power state"),
                ));
            }
            "kill" if args.iter().any(|a| a == "-1") => {
                findings.push(Finding::deny(
                    Severity::High,
                    "kill -1 signals every process",
                ));
            }
            "eval" => {
                findings.push(Finding::deny(
                    Severity::High,
                    "eval runs a dynamically built command",
                ));
            }
            "nc" | "ncat" | "netcat" => {
                if args.iter().any(|a| a == "-e" || a == "-c") {
                    findings.push(Finding::deny(
                        Severity::Critical,
                        "netcat with -e/-c spawns a reverse shell",
                    ));
                } else {
                    findings.push(Finding::warn(
                        Severity::Medium,
                        "raw network socket with netcat",
                    ));
                }
            }
            "ssh" | "scp" | "sftp" | "telnet" | "ftp" => {
                findings.push(Finding::deny(
                    Severity::High,
                    format!("`{program}` reaches hosts outside the egress allowlist"),
                ));
            }
            "sh" | "bash" | "zsh" | "dash" | "ksh" => {
                if let Some(script) = flag_value(args, "-c") {
                    if depth < MAX_NESTING {
                        self.screen_line(script, depth + 1, findings);
                    } else {
                        findings.push(Finding::deny(
                            Severity::Medium,
                            "shell scripts nested too deeply to screen",
                        ));
                    }
                }
            }
            "python" | "python3" | "perl" | "ruby" | "node" | "php" => {
                if args.iter().any(|a| a == "-c" || a == "-e") {
                    findings.push(Finding::warn(
                        Severity::Medium,
                        format!("inline `{program}` code cannot be screened"),
                    ));
                }
            }
            "yes" => {
                findings.push(Finding::deny(Severity::High, "`yes` produces unbounded output"));
            }
            "cat" if args.iter().any(|a| is_endless_device(a)) => {
                findings.push(Finding::deny(
                    Severity::High,
                    "unbounded read from an endless device",
                ));
            }
            "curl" | "wget" => self.screen_fetch(program, args, findings),
            "dig" | "nslookup" | "host" | "ping" | "traceroute" => {
                for arg in args.iter().filter(|a| !a.starts_with(['-', '@'])) {
                    if arg.contains('.') {
                        findings.extend(screen_host(arg, &self.egress));
                    }
                }
            }
            "crontab" | "at" => {
                findings.push(Finding::warn(
                    Severity::Medium,
                    format!("`{program}` schedules persistent jobs"),
                ));
            }
            _ => {}
        }
    }

    fn screen_fetch(&self, program: &str, args: &[String], findings: &mut Vec<Finding>) {
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg.starts_with('-') {
                let (flag, inline) = match arg.split_once('=') {
                    Some((flag, value)) => (flag, Some(value.to_string())),
                    None => (arg.as_str(), None),
                };
                let value = if takes_value(program, flag) && inline.is_none() {
                    iter.next().cloned()
                } else {
                    inline
                };
                match flag {
                    "-x" | "--proxy" => {
                        findings.push(Finding::deny(
                            Severity::High,
                            "fetch through a proxy bypasses the egress allowlist",
                        ));
                    }
                    "-e" if program == "wget" => {
                        findings.push(Finding::deny(
                            Severity::High,
                            "wget -e can reconfigure proxies and output paths",
                        ));
                    }
                    "-d" | "--data" | "--data-binary" | "--data-raw" | "-F" | "--form" => {
                        if value.as_deref().is_some_and(|v| v.contains('@')) {
                            findings.push(Finding::deny(
                                Severity::High,
                                "request uploads a local file",
                            ));
                        }
                    }
                    "-T" | "--upload-file" if program == "curl" => {
                        findings.push(Finding::deny(
                            Severity::High,
                            "request uploads a local file",
                        ));
                    }
                    _ => {}
                }
                continue;
            }
            if arg.contains("://") {
                // already screened as an embedded URL
                continue;
            }
            if arg.contains('.') && !arg.starts_with(['/', '.', '~']) {
                findings.extend(screen_url(&format!("http://{arg}"), &self.egress));
            }
        }
    }
}

impl Screen for ShellScreen {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn screen(&self, action: &Action) -> Vec<Finding> {
        if action.kind() != ActionKind::Shell {
            return Vec::new();
        }
        let line = action.payload().trim();
        if line.is_empty() {
            return vec![Finding::deny(Severity::Low, "empty command")];
        }
        let mut findings = Vec::new();
        self.screen_line(line, 0, &mut findings);
        findings
    }
}

/// Strip environment assignments and transparent wrappers (`env`, `nohup`,
/// `sudo`, ...) and return the real program name with its arguments.
fn unwrap_command<'a>(
    words: &'a [String],
    findings: &mut Vec<Finding>,
) -> Option<(&'a str, &'a [String])> {
    let mut rest = words;
    loop {
        let first = rest.first()?;
        if is_assignment(first) {
            rest = &rest[1..];
            continue;
        }
        let program = program_name(first);
        match program {
            "env" | "nohup" | "time" | "nice" | "timeout" | "command" | "exec" | "builtin"
            | "stdbuf" => {
                rest = skip_options(&rest[1..]);
            }
            "sudo" | "su" | "doas" | "pkexec" | "runas" => {
                findings.push(Finding::deny(
                    Severity::High,
                    format!("privilege escalation via `{program}`"),
                ));
                rest = skip_options(&rest[1..]);
            }
            _ => return Some((program, &rest[1..])),
        }
    }
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            let mut chars = name.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn program_name(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

fn skip_options(words: &[String]) -> &[String] {
    let skip = words
        .iter()
        .take_while(|w| {
            w.starts_with('-') || w.starts_with(|c: char| c.is_ascii_digit()) || is_assignment(w)
        })
        .count();
    &words[skip..]
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn takes_value(program: &str, flag: &str) -> bool {
    const SHARED: &[&str] = &[
        "-o",
        "--output",
        "-H",
        "--header",
        "-d",
        "--data",
        "--data-raw",
        "--data-binary",
        "-X",
        "--request",
        "-u",
        "--user",
        "-A",
        "--user-agent",
        "-e",
        "--referer",
        "-b",
        "--cookie",
        "-c",
        "--cookie-jar",
        "-F",
        "--form",
        "-m",
        "--max-time",
        "--connect-timeout",
        "-w",
        "--write-out",
        "-T",
        "--upload-file",
        "-x",
        "--proxy",
        "--retry",
        "-P",
        "--directory-prefix",
        "--output-document",
        "-U",
        "-t",
        "--tries",
        "--timeout",
    ];
    SHARED.contains(&flag) || (program == "wget" && flag == "-O")
}

/// Find a `scheme://...` URL inside a word.
fn embedded_url(word: &str) -> Option<&str> {
    let pos = word.find("://")?;
    let start = word[..pos]
        .rfind(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')))
        .map_or(0, |i| i + 1);
    (start < pos).then(|| &word[start..])
}

fn is_endless_device(path: &str) -> bool {
    matches!(path, "/dev/zero" | "/dev/urandom" | "/dev/random")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// `/`, `~`, a system root or a user's home directory
    Root,
    /// Anywhere outside the sandbox working directory
    Outside,
    /// Inside the working directory
    Workspace,
}

fn target_scope(target: &str) -> Scope {
    let trimmed = target.trim_end_matches(['/', '*']);
    if target.starts_with('/') {
        if trimmed.is_empty() || SYSTEM_ROOTS.contains(&trimmed) || is_home_dir(trimmed) {
            Scope::Root
        } else {
            Scope::Outside
        }
    } else if target.starts_with('~') {
        if !trimmed.contains('/') {
            Scope::Root
        } else {
            Scope::Outside
        }
    } else if target == ".."
        || target.starts_with("../")
        || target.contains("/../")
        || target.ends_with("/..")
    {
        Scope::Outside
    } else {
        Scope::Workspace
    }
}

fn is_home_dir(path: &str) -> bool {
    ["/home/", "/Users/"].iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|user| !user.is_empty() && !user.contains('/'))
    })
}

fn screen_rm(args: &[String], findings: &mut Vec<Finding>) {
    let mut recursive = false;
    let mut options_done = false;
    let mut targets = Vec::new();
    for arg in args {
        if options_done || !arg.starts_with('-') || arg == "-" {
            targets.push(arg.as_str());
            continue;
        }
        match arg.as_str() {
            "--" => options_done = true,
            "--recursive" => recursive = true,
            "--no-preserve-root" => findings.push(Finding::deny(
                Severity::Critical,
                "`--no-preserve-root` disables the root safeguard",
            )),
            long if long.starts_with("--") => {}
            short => recursive |= short.contains(['r', 'R']),
        }
    }

    for target in targets {
        match target_scope(target) {
            Scope::Root if recursive => findings.push(Finding::deny(
                Severity::Critical,
                format!("recursive delete of root or home path `{target}`"),
            )),
            Scope::Root => findings.push(Finding::deny(
                Severity::High,
                format!("delete of root or home path `{target}`"),
            )),
            Scope::Outside => findings.push(Finding::deny(
                Severity::High,
                format!("delete outside the workspace: `{target}`"),
            )),
            Scope::Workspace if recursive && matches!(target, "." | "./" | "*" | "./*") => {
                findings.push(Finding::warn(
                    Severity::Medium,
                    "recursive delete of the entire workspace",
                ));
            }
            Scope::Workspace => {}
        }
    }
}

fn screen_find(args: &[String], findings: &mut Vec<Finding>) {
    let deletes = args.iter().any(|a| a == "-delete")
        || args
            .windows(2)
            .any(|w| w[0] == "-exec" && matches!(program_name(&w[1]), "rm" | "shred"));
    if !deletes {
        return;
    }
    let roots = args.iter().take_while(|a| !a.starts_with('-'));
    for root in roots {
        match target_scope(root) {
            Scope::Root => findings.push(Finding::deny(
                Severity::Critical,
                format!("find deletes under root or home path `{root}`"),
            )),
            Scope::Outside => findings.push(Finding::deny(
                Severity::High,
                format!("find deletes outside the workspace: `{root}`"),
            )),
            Scope::Workspace => {}
        }
    }
}

fn screen_dd(args: &[String], findings: &mut Vec<Finding>) {
    for arg in args {
        if let Some(output) = arg.strip_prefix("of=") {
            screen_write_target(output, findings);
        }
    }
    let endless_input = args
        .iter()
        .filter_map(|a| a.strip_prefix("if="))
        .any(is_endless_device);
    if endless_input && !args.iter().any(|a| a.starts_with("count=")) {
        findings.push(Finding::deny(
            Severity::High,
            "dd from an endless device without a count",
        ));
    }
}

fn screen_write_target(target: &str, findings: &mut Vec<Finding>) {
    if matches!(target, "/dev/null" | "/dev/stdout" | "/dev/stderr") {
        return;
    }
    if target.starts_with("/dev/") {
        findings.push(Finding::deny(
            Severity::Critical,
            format!("write to device `{target}`"),
        ));
        return;
    }
    if target_scope(target) != Scope::Workspace {
        findings.push(Finding::deny(
            Severity::High,
            format!("write outside the workspace: `{target}`"),
        ));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hazard {
    Separator(char),
    Newline,
    Backtick,
    CommandSubstitution,
    ProcessSubstitution,
    VariableExpansion,
    UnterminatedQuote,
}

impl Hazard {
    fn finding(self) -> Finding {
        match self {
            Hazard::Separator(c) => Finding::deny(
                Severity::High,
                format!("shell metacharacter `{c}` chains additional commands"),
            ),
            Hazard::Newline => {
                Finding::deny(Severity::High, "newline chains additional commands")
            }
            Hazard::Backtick => {
                Finding::deny(Severity::High, "backtick command substitution")
            }
            Hazard::CommandSubstitution => {
                Finding::deny(Severity::High, "`$(...)` command substitution")
            }
            Hazard::ProcessSubstitution => {
                Finding::deny(Severity::High, "process substitution")
            }
            Hazard::VariableExpansion => {
                Finding::deny(Severity::Medium, "unescaped variable expansion")
            }
            Hazard::UnterminatedQuote => Finding::deny(Severity::Medium, "unterminated quote"),
        }
    }
}

#[derive(Debug)]
struct Redirect {
    write: bool,
    target: String,
}

#[derive(Debug, Default)]
struct Lexed {
    commands: Vec<Vec<String>>,
    redirects: Vec<Redirect>,
    hazards: Vec<Hazard>,
}

#[derive(Debug, Default)]
struct Lexer {
    lexed: Lexed,
    command: Vec<String>,
    word: String,
    in_word: bool,
    /// Set when the next word is the target of a redirection; `true` for writes.
    redirect: Option<bool>,
}

impl Lexer {
    fn push(&mut self, c: char) {
        self.word.push(c);
        self.in_word = true;
    }

    fn hazard(&mut self, hazard: Hazard) {
        if !self.lexed.hazards.contains(&hazard) {
            self.lexed.hazards.push(hazard);
        }
    }

    fn end_word(&mut self) {
        if !self.in_word {
            return;
        }
        self.in_word = false;
        let word = std::mem::take(&mut self.word);
        match self.redirect.take() {
            Some(write) => self.lexed.redirects.push(Redirect {
                write,
                target: word,
            }),
            None => self.command.push(word),
        }
    }

    fn end_command(&mut self) {
        self.end_word();
        if !self.command.is_empty() {
            let command = std::mem::take(&mut self.command);
            self.lexed.commands.push(command);
        }
    }
}

fn dollar_hazard(next: Option<char>) -> Option<Hazard> {
    match next? {
        '(' => Some(Hazard::CommandSubstitution),
        '{' | '@' | '*' | '#' | '?' | '$' | '!' | '-' => Some(Hazard::VariableExpansion),
        c if c.is_ascii_alphanumeric() || c == '_' => Some(Hazard::VariableExpansion),
        _ => None,
    }
}

fn lex(input: &str) -> Lexed {
    let chars: Vec<char> = input.chars().collect();
    let mut lx = Lexer::default();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => lx.end_word(),
            '\n' | '\r' => {
                lx.hazard(Hazard::Newline);
                lx.end_command();
            }
            ';' | '|' | '&' => {
                lx.hazard(Hazard::Separator(c));
                lx.end_command();
            }
            '\\' => match chars.get(i + 1) {
                Some('\n') => i += 1,
                Some(&next) => {
                    lx.push(next);
                    i += 1;
                }
                None => lx.push('\\'),
            },
            '\'' => {
                lx.in_word = true;
                match chars[i + 1..].iter().position(|&ch| ch == '\'') {
                    Some(len) => {
                        lx.word.extend(&chars[i + 1..i + 1 + len]);
                        i += len + 1;
                    }
                    None => {
                        lx.hazard(Hazard::UnterminatedQuote);
                        lx.word.extend(&chars[i + 1..]);
                        i = chars.len();
                    }
                }
            }
            '"' => {
                lx.in_word = true;
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' if matches!(chars.get(i + 1), Some('$' | '`' | '"' | '\\')) => {
                            lx.word.push(chars[i + 1]);
                            i += 1;
                        }
                        '\\' if chars.get(i + 1) == Some(&'\n') => i += 1,
                        '`' => {
                            lx.hazard(Hazard::Backtick);
                            lx.word.push('`');
                        }
                        '$' => {
                            if let Some(hazard) = dollar_hazard(chars.get(i + 1).copied()) {
                                lx.hazard(hazard);
                            }
                            lx.word.push('$');
                        }
                        ch => lx.word.push(ch),
                    }
                    i += 1;
                }
                if !closed {
                    lx.hazard(Hazard::UnterminatedQuote);
                }
            }
            '`' => {
                lx.hazard(Hazard::Backtick);
                lx.push(c);
            }
            '$' => {
                if let Some(hazard) = dollar_hazard(chars.get(i + 1).copied()) {
                    lx.hazard(hazard);
                }
                lx.push(c);
            }
            '>' | '<' => {
                if chars.get(i + 1) == Some(&'(') {
                    lx.hazard(Hazard::ProcessSubstitution);
                }
                // digits glued to the operator name a file descriptor
                if lx.in_word && lx.word.chars().all(|d| d.is_ascii_digit()) {
                    lx.word.clear();
                    lx.in_word = false;
                } else {
                    lx.end_word();
                }
                let write = c == '>';
                while matches!(chars.get(i + 1), Some('>' | '<')) {
                    i += 1;
                }
                if chars.get(i + 1) == Some(&'&') {
                    i += 1;
                    while chars
                        .get(i + 1)
                        .is_some_and(|d| d.is_ascii_digit() || *d == '-')
                    {
                        i += 1;
                    }
                } else {
                    lx.redirect = Some(write);
                }
            }
            _ => lx.push(c),
        }
        i += 1;
    }
    lx.end_command();
    lx.lexed
}
