use crate::config::types::{Action, CrateType, Mode, SubmissionFlags};
use serde::{Deserialize, Serialize};

/// Default invocation of a toolchain for one action.
///
/// Arguments may contain `{placeholder}` tokens filled from the submission
/// flags at launch time. An argument that consists of a single placeholder
/// and renders to the empty string is dropped, so optional flags such as
/// `{release_flag}` disappear cleanly in debug mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn render(&self, flags: &SubmissionFlags) -> Vec<String> {
        let values = placeholder_values(flags);

        self.args
            .iter()
            .filter_map(|arg| {
                let mut rendered = arg.clone();
                for (name, value) in &values {
                    rendered = rendered.replace(name, value);
                }
                let is_bare_placeholder = arg.starts_with('{') && arg.ends_with('}');
                if is_bare_placeholder && rendered.is_empty() {
                    None
                } else {
                    Some(rendered)
                }
            })
            .collect()
    }
}

fn placeholder_values(flags: &SubmissionFlags) -> [(&'static str, String); 6] {
    let release_flag = match flags.mode {
        Mode::Debug => "",
        Mode::Release => "--release",
    };

    // A library has no entry point, so "run" builds it unless tests were asked for
    let run_verb = match (flags.tests, flags.crate_type) {
        (true, _) => "test",
        (false, CrateType::Bin) => "run",
        (false, CrateType::Lib) => "build",
    };

    let emit_flag = flags
        .target
        .emit_kind()
        .map(|kind| format!("--emit={kind}"))
        .unwrap_or_default();

    [
        ("{edition}", flags.edition.as_str().to_string()),
        ("{release_flag}", release_flag.to_string()),
        ("{run_verb}", run_verb.to_string()),
        ("{emit_flag}", emit_flag),
        ("{source_path}", flags.crate_type.source_path().to_string()),
        ("{crate_type}", flags.crate_type.as_str().to_string()),
    ]
}

/// Default templates, one per supported action
pub(crate) fn channel_command(action: Action) -> CommandTemplate {
    match action {
        Action::Compile => CommandTemplate::new([
            "cargo",
            "rustc",
            "{release_flag}",
            "--",
            "{emit_flag}",
        ]),
        _ => CommandTemplate::new(["cargo", "{run_verb}", "{release_flag}"]),
    }
}

pub(crate) fn formatter_command() -> CommandTemplate {
    CommandTemplate::new([
        "rustfmt",
        "--edition",
        "{edition}",
        "--emit",
        "stdout",
        "{source_path}",
    ])
}

pub(crate) fn linter_command() -> CommandTemplate {
    CommandTemplate::new(["cargo", "clippy", "{release_flag}"])
}

pub(crate) fn verifier_command() -> CommandTemplate {
    CommandTemplate::new(["cargo", "kani"])
}

pub(crate) fn memory_sanitizer_command() -> CommandTemplate {
    CommandTemplate::new(["cargo", "miri", "{run_verb}"])
}
