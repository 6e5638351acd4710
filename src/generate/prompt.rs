use crate::backtest::model::{Failure, FailureCategory, GeneratedCode};
use crate::backtest::worker::tail;
use crate::generate::client::CodePrompt;
use std::time::Duration;

const REPAIR_TRACEBACK_LIMIT: usize = 3_000;

/// Builds generation and repair prompts around one fixed execution contract.
pub struct PromptBuilder {
    language: String,
    deadline: Duration,
}

impl PromptBuilder {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            deadline: Duration::from_secs(30),
        }
    }

    /// Execution deadline quoted to the model.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Human name of the sandbox language for a script extension.
    pub fn language_for_extension(ext: &str) -> String {
        match ext.trim_start_matches('.') {
            "py" => "Python 3".to_string(),
            "js" | "mjs" => "JavaScript (Node.js)".to_string(),
            "sh" => "POSIX shell".to_string(),
            other => other.to_string(),
        }
    }

    fn system(&self) -> String {
        format!(
            "You are a quantitative developer. You turn trading ideas into complete, \
             self-contained {} backtest programs. Reply with exactly one fenced code block.",
            self.language
        )
    }

    fn contract(&self) -> Vec<String> {
        vec![
            "PROGRAM CONTRACT (mandatory):".to_string(),
            "1. The program is run as: <interpreter> strategy <data.csv> <params.json>.".to_string(),
            "2. data.csv has the header datetime,open,high,low,close,volume, one bar per row, oldest first.".to_string(),
            "3. params.json holds {\"cash\": <starting cash>, \"commission\": <fraction per trade>}. Use both.".to_string(),
            "4. No network access, no user input, no files other than the two inputs, no plotting.".to_string(),
            "5. The run must be deterministic: no unseeded randomness, no wall-clock dependence.".to_string(),
            format!(
                "6. Finish well within {} seconds; every loop must be bounded by the number of bars.",
                self.deadline.as_secs().max(1)
            ),
            "7. As the LAST line of stdout print: METRICS: {\"return_pct\": ..., \"buy_hold_pct\": ..., \"max_drawdown_pct\": ..., \"sharpe\": ..., \"sortino\": ..., \"trade_count\": ...}".to_string(),
            "   (percent values as percentages, e.g. 12.5 for +12.5%; valid JSON).".to_string(),
            "8. Do not swallow exceptions: let errors terminate the program with a traceback.".to_string(),
        ]
    }

    /// Attempt 0: idea only.
    pub fn initial(&self, idea: &str) -> CodePrompt {
        let mut lines = Vec::new();
        lines.push("Write a backtest for the following trading idea.".to_string());
        lines.push(String::new());
        lines.push("IDEA:".to_string());
        lines.push(idea.trim().to_string());
        lines.push(String::new());
        lines.extend(self.contract());
        lines.push(String::new());
        lines.push("Return the full program in a single fenced code block.".to_string());

        CodePrompt {
            system: self.system(),
            user: lines.join("\n"),
        }
    }

    /// Attempt n+1: the failing version plus what went wrong with it.
    pub fn repair(&self, idea: &str, code: &GeneratedCode, failure: &Failure) -> CodePrompt {
        let mut lines = Vec::new();
        lines.push(format!(
            "The program below (attempt {}) failed. Fix it and return the complete corrected program.",
            code.attempt
        ));
        lines.push(String::new());
        lines.push("IDEA:".to_string());
        lines.push(idea.trim().to_string());
        lines.push(String::new());
        lines.push(format!("FAILURE CATEGORY: {}", failure.category));
        lines.push(format!("ERROR: {}", failure.message));
        let tb = failure.traceback.trim();
        if !tb.is_empty() {
            lines.push("TRACEBACK (tail):".to_string());
            lines.push(tail(tb, REPAIR_TRACEBACK_LIMIT).to_string());
        }
        lines.push(String::new());
        lines.push(format!("HINT: {}", hint(failure.category)));
        lines.push(String::new());
        lines.push("FAILING PROGRAM:".to_string());
        lines.push("```".to_string());
        lines.push(code.text.clone());
        lines.push("```".to_string());
        lines.push(String::new());
        lines.extend(self.contract());

        CodePrompt {
            system: self.system(),
            user: lines.join("\n"),
        }
    }

    /// Generation itself failed on the previous attempt; ask again with the
    /// last known defect, if any.
    pub fn retry(&self, idea: &str, last: Option<(&GeneratedCode, &Failure)>) -> CodePrompt {
        match last {
            Some((code, failure)) => self.repair(idea, code, failure),
            None => self.initial(idea),
        }
    }
}

fn hint(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::SyntaxError => {
            "The program does not parse. Return complete, syntactically valid code; do not truncate it."
        }
        FailureCategory::RuntimeError => {
            "Fix the error shown. Check every name is defined and imported and that parameter names match the library you use."
        }
        FailureCategory::Timeout => {
            "The program ran past its deadline. Remove unbounded or nested loops over the whole series and avoid any waiting."
        }
        FailureCategory::InvalidResult => {
            "The program finished without a valid METRICS line. Make sure the backtest actually runs and the last stdout line is METRICS: {json}."
        }
        _ => "Return a complete, working program.",
    }
}
