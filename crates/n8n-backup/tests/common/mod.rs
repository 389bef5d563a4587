//! # common
//!

#![allow(dead_code)]

use core::cell::RefCell;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use n8n_backup::{
    config::Config,
    runner::{CommandOutput, CommandRunner, CommandSpec, RunError},
};
use walkdir::WalkDir;

pub const WORKFLOWS: [(&str, &str); 3] = [
    (
        "1.json",
        r#"{"id":"1","name":"Daily report","nodes":[],"connections":{}}"#,
    ),
    (
        "2.json",
        r#"{"id":"2","name":"Webhook","nodes":[{"id":"a","name":"Hook"}],"connections":{}}"#,
    ),
    (
        "3.json",
        r#"{"id":"3","name":"Cleanup","nodes":[],"connections":{},"active":true}"#,
    ),
];

pub const CREDENTIALS: &str =
    r#"[{"id":"c1","name":"Mail","type":"smtp","data":{"user":"a","password":"b"}}]"#;

pub const KEY: &str = "0123456789abcdef0123456789abcdef";
pub const OTHER_KEY: &str = "fedcba9876543210fedcba9876543210";

type Matcher = Box<dyn Fn(&CommandSpec) -> bool>;
type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, RunError>>;

/// A [`CommandRunner`] that answers from scripted rules and records every call.
///
/// The first matching rule answers, commands without a rule succeed with no output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Vec<(Matcher, Responder)>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands matching `matcher` with `respond`.
    pub fn on(
        mut self,
        matcher: impl Fn(&CommandSpec) -> bool + 'static,
        respond: impl Fn(&CommandSpec) -> Result<CommandOutput, RunError> + 'static,
    ) -> Self {
        self.rules.push((Box::new(matcher), Box::new(respond)));
        self
    }

    /// Answer commands containing every argument in `args` with `output`.
    pub fn on_args(self, args: &'static [&'static str], output: CommandOutput) -> Self {
        self.on(
            move |command| args.iter().all(|arg| command.has_arg(arg)),
            move |_| Ok(output.clone()),
        )
    }

    /// Fail commands for `program` as if it was not installed.
    pub fn missing(self, program: &'static str) -> Self {
        self.on(
            move |command| command.program == program,
            move |_| Err(RunError::NotFound(program.to_string())),
        )
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    /// Calls that invoke the n8n CLI, directly or through `docker exec`.
    pub fn n8n_calls(&self) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|command| command.program == "n8n" || command.has_arg("n8n"))
            .collect()
    }

    /// The first call that has `arg`.
    pub fn call_with(&self, arg: &str) -> Option<CommandSpec> {
        self.calls().into_iter().find(|command| command.has_arg(arg))
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RunError> {
        self.calls.borrow_mut().push(command.clone());

        for (matcher, respond) in &self.rules {
            if matcher(command) {
                return respond(command);
            }
        }

        Ok(CommandOutput::ok(""))
    }
}

/// A config with every path inside `root`.
pub fn test_config(root: &Path) -> Config {
    Config {
        backup_directory: root.join("backups"),
        log_directory: root.join("logs"),
        n8n_config_path: Some(root.join("n8n").join("config")),
        custom_key_file: root.join("config").join(".n8n_encryption_key"),
        database_path: Some(root.join("n8n").join("database.sqlite")),
        ..Config::default()
    }
}

/// Write three workflows and a credential export into `directory`.
pub fn write_export(directory: &Path) {
    write_workflows(&directory.join("workflows"));
    fs::write(directory.join("credentials.json"), CREDENTIALS).unwrap();
}

/// Write the three workflow files into `directory`.
pub fn write_workflows(directory: &Path) {
    fs::create_dir_all(directory).unwrap();
    for (name, contents) in WORKFLOWS {
        fs::write(directory.join(name), contents).unwrap();
    }
}

/// Every file under `root` keyed by its relative path.
pub fn file_set(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .map(Result::unwrap)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(entry.path()).unwrap())
        })
        .collect()
}

/// A fake n8n CLI responder for `export:workflow` and `export:credentials`.
///
/// Writes the fixture export to wherever `--output=` points.
pub fn fake_export(command: &CommandSpec) -> Result<CommandOutput, RunError> {
    let output = command.arg_with_prefix("--output=").unwrap();

    if command.has_arg("export:workflow") {
        write_workflows(Path::new(output));
        Ok(CommandOutput::ok("Successfully exported 3 workflows."))
    } else {
        fs::write(output, CREDENTIALS).unwrap();
        Ok(CommandOutput::ok("Successfully exported 1 credentials."))
    }
}

/// A fake n8n CLI responder for imports that copies the input into `target`.
pub fn fake_import(target: PathBuf) -> impl Fn(&CommandSpec) -> Result<CommandOutput, RunError> {
    move |command| {
        let input = PathBuf::from(command.arg_with_prefix("--input=").unwrap());

        if command.has_arg("import:workflow") {
            let destination = target.join("workflows");
            fs::create_dir_all(&destination).unwrap();

            let mut count = 0;
            for entry in fs::read_dir(&input).unwrap() {
                let path = entry.unwrap().path();
                fs::copy(&path, destination.join(path.file_name().unwrap())).unwrap();
                count += 1;
            }

            Ok(CommandOutput::ok(format!(
                "Importing {count} workflows...\nSuccessfully imported {count} workflows."
            )))
        } else {
            fs::create_dir_all(&target).unwrap();
            fs::copy(&input, target.join("credentials.json")).unwrap();
            Ok(CommandOutput::ok("Successfully imported 1 credential."))
        }
    }
}

/// Matches n8n CLI commands with `subcommand`.
pub fn is_n8n(subcommand: &'static str) -> impl Fn(&CommandSpec) -> bool {
    move |command| command.has_arg(subcommand)
}
