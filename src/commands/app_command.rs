use std::str::FromStr;

const DEFAULT_RUN_LIMIT: u64 = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    Idea { text: String },
    Batch { path: String },
    Runs { limit: u64 },
    Show { run_id: String },
    Cancel { run_id: String },
    Active,
    Help,
    Quit,
    Unknown(String),
}

impl FromStr for AppCommand {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(AppCommand::Unknown("".to_string()));
        }

        match parts[0] {
            "idea" | "i" => {
                let text = parts[1..].join(" ");
                if text.is_empty() {
                    Ok(AppCommand::Unknown("usage: idea <strategy description>".to_string()))
                } else {
                    Ok(AppCommand::Idea { text })
                }
            }
            "batch" | "b" => match parts.get(1) {
                Some(path) => Ok(AppCommand::Batch {
                    path: path.to_string(),
                }),
                None => Ok(AppCommand::Unknown("usage: batch <file>".to_string())),
            },
            "runs" | "ls" => {
                let limit = parts
                    .get(1)
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(DEFAULT_RUN_LIMIT);
                Ok(AppCommand::Runs { limit })
            }
            "show" | "s" => match parts.get(1) {
                Some(id) => Ok(AppCommand::Show {
                    run_id: id.to_string(),
                }),
                None => Ok(AppCommand::Unknown("usage: show <run_id>".to_string())),
            },
            "cancel" | "c" => match parts.get(1) {
                Some(id) => Ok(AppCommand::Cancel {
                    run_id: id.to_string(),
                }),
                None => Ok(AppCommand::Unknown("usage: cancel <run_id>".to_string())),
            },
            "active" => Ok(AppCommand::Active),
            "help" | "h" => Ok(AppCommand::Help),
            "quit" | "q" | "exit" => Ok(AppCommand::Quit),
            other => Ok(AppCommand::Unknown(format!("unknown command: {}", other))),
        }
    }
}

pub const HELP: &str = "\
commands:
  idea <text>       generate, repair and evaluate a strategy for <text>
  batch <file>      submit every non-empty line of <file> as an idea
  runs [n]          list the n most recent runs (default 20)
  show <run_id>     print a run with its accepted code and results
  cancel <run_id>   cancel a run that is still in progress
  active            list runs in progress in this process
  help              this text
  quit              exit";
