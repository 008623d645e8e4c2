//! Three-way block classification.
//!
//! Classification walks an ordered rule table; the first rule whose language
//! class and structural predicate both match decides the tag, and its name is
//! recorded on the unit. Loss prevention and intent contradiction run as
//! separate passes after the table.

use crate::intent;
use crate::static_regex;
use crate::types::{Block, CodeUnit, UnitTag};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Language families the rule table keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LangClass {
    Markup,
    Script,
    Shell,
    Other,
}

impl LangClass {
    pub fn of(language: &str) -> Self {
        match language.to_lowercase().as_str() {
            "txt" | "text" | "plaintext" | "yaml" | "yml" | "json" | "xml" => Self::Markup,
            "python" | "py" | "c" | "cpp" | "c++" | "rust" | "java" | "javascript" | "js" => {
                Self::Script
            }
            "bash" | "sh" | "shell" | "zsh" | "" => Self::Shell,
            _ => Self::Other,
        }
    }
}

/// Precomputed view of a block the predicates work on.
#[derive(Debug)]
pub struct Shape<'a> {
    pub text: &'a str,
    /// Non-blank lines, trimmed.
    pub lines: Vec<&'a str>,
    /// Non-blank, non-comment lines.
    pub meaningful: usize,
    /// Lines joined with single spaces.
    pub joined: String,
    /// Another block in the same reply is a script-language program.
    pub has_script_sibling: bool,
}

impl<'a> Shape<'a> {
    pub fn new(block: &'a Block, siblings: &[Block]) -> Self {
        let lines: Vec<&str> = block
            .text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let meaningful = lines
            .iter()
            .filter(|l| !l.starts_with('#') && !l.starts_with("//"))
            .count();
        let joined = lines.join(" ");
        let has_script_sibling = siblings.iter().any(|s| {
            s.ordinal != block.ordinal && LangClass::of(&s.language) == LangClass::Script
        });
        Self {
            text: &block.text,
            lines,
            meaningful,
            joined,
            has_script_sibling,
        }
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }
}

/// One row of the rule table.
#[derive(Debug)]
pub struct Rule {
    pub name: &'static str,
    /// `None` applies to every language.
    pub class: Option<LangClass>,
    pub predicate: fn(&Shape<'_>) -> bool,
    pub tag: UnitTag,
}

static BACKGROUNDING: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"python3?\s+\S+\.py\s*&",
        r"nohup\s+python",
        r"kill\s+\$\(cat\s+",
    ]
    .iter()
    .map(|p| static_regex(p))
    .collect()
});
static FG: LazyLock<Regex> = LazyLock::new(|| static_regex(r"\bfg\b"));
static CTRL: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?i)ctrl"));
static PROCESS_LISTING: LazyLock<Regex> = LazyLock::new(|| static_regex(r"\b\d+\s+\d+\.\d+\s+"));
static PLACEHOLDER_PID: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"(?i)kill\s+(-\d+\s+)?(\d{4,5}|<PID>)"));
static PS_PIPE: LazyLock<Regex> = LazyLock::new(|| static_regex(r"^ps\s+aux\s*\|"));
static INSTALL_OR_SYSTEM: LazyLock<Regex> = LazyLock::new(|| {
    static_regex(r"(?i)^(sudo\s+)?(pip3?\s+install|chmod\s+|apt(-get)?\s+install)|^sudo\s+(reboot|shutdown|halt)")
});
static PROMPT_TRANSCRIPT: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?m)^\$\s+"));
static RUNS_PROGRAM: LazyLock<Regex> = LazyLock::new(|| {
    static_regex(
        r"(?i)^(python3?\s+\S+\.py|node\s+\S+\.js|gcc\s+|g\+\+\s+|make\b|\./\w+|cd\s+.*&&\s*(python|node|gcc|make|bash|\./))",
    )
});
static DIRECT_COMMANDS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^pkill\s+(-\w+\s+)*-f\s+\S+",
        r"(?i)^pkill\s+(-\d+\s+)?\w+",
        r"(?i)^killall\s+",
        r"(?i)^systemctl\s+(stop|restart|start)",
        r"(?i)^service\s+\S+\s+(stop|restart)",
    ]
    .iter()
    .map(|p| static_regex(p))
    .collect()
});
static CONSTRUCTIVE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (static_regex(r"\bnohup\b"), "nohup launch"),
        (static_regex(r"(?m)(^|[^&])&[ \t]*$"), "background launch"),
        (static_regex(r"(?i)\bsystemctl\s+(start|enable)\b"), "service start"),
        (static_regex(r"(?i)\bservice\s+\S+\s+start\b"), "service start"),
        (static_regex(r">>?\s*\S*\.pid\b"), "pid file write"),
        (static_regex(r"\becho\s+\$!"), "background pid capture"),
    ]
});

const SHELL_CONTROL_FLOW: &[&str] = &["for ", "while ", "if ", "function ", "#!/"];
const LOGIC_KEYWORDS: &[&str] = &[
    "def ", "class ", "import ", "from ", "for ", "while ", "if ", "#include", "int main",
    "void ", "fn ",
];

fn always(_: &Shape<'_>) -> bool {
    true
}

fn has_meaningful_line(s: &Shape<'_>) -> bool {
    s.meaningful >= 1
}

fn backgrounding_idiom(s: &Shape<'_>) -> bool {
    s.line_count() <= 5
        && (BACKGROUNDING.iter().any(|re| re.is_match(&s.joined))
            || (FG.is_match(&s.joined) && CTRL.is_match(&s.joined)))
}

fn example_process_listing(s: &Shape<'_>) -> bool {
    s.line_count() <= 2 && PROCESS_LISTING.is_match(s.text)
}

fn placeholder_pid(s: &Shape<'_>) -> bool {
    s.line_count() <= 2 && PLACEHOLDER_PID.is_match(s.text)
}

fn lone_ps_pipe(s: &Shape<'_>) -> bool {
    s.line_count() == 1 && PS_PIPE.is_match(&s.joined)
}

fn install_or_system(s: &Shape<'_>) -> bool {
    s.line_count() <= 2 && INSTALL_OR_SYSTEM.is_match(&s.joined)
}

fn prompt_transcript(s: &Shape<'_>) -> bool {
    s.line_count() <= 2 && PROMPT_TRANSCRIPT.is_match(s.text)
}

fn runs_sibling_program(s: &Shape<'_>) -> bool {
    s.has_script_sibling && s.line_count() <= 3 && RUNS_PROGRAM.is_match(&s.joined)
}

fn actionable_command(s: &Shape<'_>) -> bool {
    DIRECT_COMMANDS.iter().any(|re| re.is_match(&s.joined))
}

fn long_script(s: &Shape<'_>) -> bool {
    s.line_count() >= 5
}

fn shell_control_flow(s: &Shape<'_>) -> bool {
    SHELL_CONTROL_FLOW.iter().any(|kw| s.text.contains(kw))
}

fn short(s: &Shape<'_>) -> bool {
    s.line_count() <= 2
}

fn short_without_logic(s: &Shape<'_>) -> bool {
    s.line_count() <= 2 && !LOGIC_KEYWORDS.iter().any(|kw| s.text.contains(kw))
}

/// The rule table. Order matters: first match wins.
pub static RULES: &[Rule] = &[
    Rule {
        name: "markup_block",
        class: Some(LangClass::Markup),
        predicate: always,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "script_program",
        class: Some(LangClass::Script),
        predicate: has_meaningful_line,
        tag: UnitTag::Program,
    },
    Rule {
        name: "shell_backgrounding_idiom",
        class: Some(LangClass::Shell),
        predicate: backgrounding_idiom,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "shell_example_process_listing",
        class: Some(LangClass::Shell),
        predicate: example_process_listing,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "shell_placeholder_pid",
        class: Some(LangClass::Shell),
        predicate: placeholder_pid,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "shell_lone_ps_pipe",
        class: Some(LangClass::Shell),
        predicate: lone_ps_pipe,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "shell_install_or_system",
        class: Some(LangClass::Shell),
        predicate: install_or_system,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "shell_prompt_transcript",
        class: Some(LangClass::Shell),
        predicate: prompt_transcript,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "shell_runs_sibling_program",
        class: Some(LangClass::Shell),
        predicate: runs_sibling_program,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "shell_actionable_command",
        class: Some(LangClass::Shell),
        predicate: actionable_command,
        tag: UnitTag::DirectCommand,
    },
    Rule {
        name: "shell_long_script",
        class: Some(LangClass::Shell),
        predicate: long_script,
        tag: UnitTag::Program,
    },
    Rule {
        name: "shell_control_flow",
        class: Some(LangClass::Shell),
        predicate: shell_control_flow,
        tag: UnitTag::Program,
    },
    Rule {
        name: "shell_short",
        class: Some(LangClass::Shell),
        predicate: short,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "short_without_logic",
        class: None,
        predicate: short_without_logic,
        tag: UnitTag::Discard,
    },
    Rule {
        name: "program_fallback",
        class: None,
        predicate: always,
        tag: UnitTag::Program,
    },
];

/// Rule name given to the unit re-tagged by loss prevention.
pub const FORCED_RULE: &str = "force_retain_largest";
/// Rule name given to units discarded for contradicting the task intent.
pub const CONTRADICTION_RULE: &str = "intent_contradiction";

/// Classify one block against its siblings. Pure function of content.
pub fn classify(block: &Block, siblings: &[Block]) -> (UnitTag, &'static str) {
    let class = LangClass::of(&block.language);
    let shape = Shape::new(block, siblings);
    RULES
        .iter()
        .find(|rule| rule.class.map_or(true, |c| c == class) && (rule.predicate)(&shape))
        .map_or((UnitTag::Program, "program_fallback"), |rule| {
            (rule.tag, rule.name)
        })
}

/// If every unit was discarded, re-tag the largest (first on ties) as Program.
/// Returns the ordinal of the forced unit.
pub fn retain_largest(units: &mut [CodeUnit]) -> Option<usize> {
    if units.is_empty() || units.iter().any(|u| u.tag.is_retained()) {
        return None;
    }
    let mut largest = 0;
    for (i, unit) in units.iter().enumerate() {
        if unit.text.len() > units[largest].text.len() {
            largest = i;
        }
    }
    let unit = &mut units[largest];
    unit.tag = UnitTag::Program;
    unit.rule = FORCED_RULE.to_string();
    unit.forced = true;
    Some(unit.ordinal)
}

/// Warning text when a unit would re-create what a destructive task removes.
pub fn detect_contradiction(task: &str, unit: &CodeUnit) -> Option<String> {
    if !unit.tag.is_retained() || !intent::is_destructive(task) {
        return None;
    }
    let (_, what) = CONSTRUCTIVE.iter().find(|(re, _)| re.is_match(&unit.text))?;
    Some(format!(
        "Block #{} ({}) contains a {what}, which contradicts the task's intent to stop or remove something; discarded.",
        unit.ordinal + 1,
        if unit.language.is_empty() { "untagged" } else { unit.language.as_str() },
    ))
}

/// Classified units for one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub units: Vec<CodeUnit>,
    pub warnings: Vec<String>,
    /// Contradiction discards emptied the retained set.
    pub contradiction: bool,
}

impl Classification {
    pub fn retained(&self) -> impl Iterator<Item = &CodeUnit> {
        self.units.iter().filter(|u| u.tag.is_retained())
    }

    pub fn has_retained(&self) -> bool {
        self.retained().next().is_some()
    }
}

/// Full pipeline: rule table, loss prevention, contradiction pass.
pub fn classify_all(task: &str, blocks: &[Block]) -> Classification {
    let mut units: Vec<CodeUnit> = blocks
        .iter()
        .map(|block| {
            let (tag, rule) = classify(block, blocks);
            CodeUnit::new(block, tag, rule)
        })
        .collect();

    retain_largest(&mut units);

    let mut warnings = Vec::new();
    let mut discarded_any = false;
    for unit in &mut units {
        if let Some(warning) = detect_contradiction(task, unit) {
            unit.tag = UnitTag::Discard;
            unit.rule = CONTRADICTION_RULE.to_string();
            warnings.push(warning);
            discarded_any = true;
        }
    }
    let contradiction = discarded_any && !units.iter().any(|u| u.tag.is_retained());

    Classification {
        units,
        warnings,
        contradiction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(language: &str, code: &str) -> UnitTag {
        let block = Block::new(0, language, code);
        classify(&block, std::slice::from_ref(&block)).0
    }

    #[test]
    fn actionable_one_liners_are_direct_commands() {
        for code in [
            "pkill -f infinite_counter",
            "pkill -f counter.py",
            "pkill -9 python3",
            "killall python3",
            "systemctl stop myservice",
            "service nginx restart",
        ] {
            assert_eq!(tag("bash", code), UnitTag::DirectCommand, "{code}");
        }
    }

    #[test]
    fn noise_is_discarded() {
        for (lang, code) in [
            ("bash", "ps aux | grep python"),
            ("bash", "kill 12345"),
            ("bash", "kill -9 12345"),
            ("bash", "kill -9 <PID>"),
            ("bash", "python3 infinite_counter.py &\necho $! > infinite_counter.pid"),
            ("text", "scoobyxd 12345 0.3 ... python3 counter.py"),
            ("bash", "Ctrl+C"),
            ("bash", "pip install paramiko"),
            ("bash", "sudo reboot"),
            ("bash", "$ ls -la"),
            ("json", "{\"a\": 1}"),
        ] {
            assert_eq!(tag(lang, code), UnitTag::Discard, "{code}");
        }
    }

    #[test]
    fn real_programs() {
        assert_eq!(
            tag(
                "python",
                "import os\nimport signal\nfor pid in os.listdir('/proc'):\n    pass\n"
            ),
            UnitTag::Program
        );
        assert_eq!(
            tag("python", "import subprocess\nsubprocess.run(['pkill', '-f', 'counter'])"),
            UnitTag::Program
        );
        assert_eq!(
            tag(
                "bash",
                "#!/bin/bash\nfor pid in $(pgrep -f counter); do\n    kill -9 $pid\ndone\necho Done"
            ),
            UnitTag::Program
        );
        assert_eq!(tag("", "cd /tmp\nls\necho a\necho b\necho c"), UnitTag::Program);
    }

    #[test]
    fn comment_only_script_falls_through() {
        assert_eq!(tag("python", "# nothing to do"), UnitTag::Discard);
    }

    #[test]
    fn run_line_next_to_program_is_discarded() {
        let program = Block::new(0, "python", "print('hi')");
        let run = Block::new(1, "bash", "python3 hello.py");
        let blocks = vec![program, run];
        assert_eq!(classify(&blocks[1], &blocks).0, UnitTag::Discard);
        assert_eq!(classify(&blocks[1], &blocks).1, "shell_runs_sibling_program");
    }

    #[test]
    fn classification_is_deterministic() {
        let block = Block::new(0, "bash", "pkill -f counter");
        let blocks = [block.clone()];
        assert_eq!(classify(&block, &blocks), classify(&block, &blocks));
    }

    #[test]
    fn loss_prevention_retains_exactly_the_largest() {
        let blocks = vec![
            Block::new(0, "text", "short"),
            Block::new(1, "text", "the longest block of them all"),
            Block::new(2, "bash", "kill 12345"),
        ];
        let result = classify_all("print things", &blocks);
        let retained: Vec<&CodeUnit> = result.retained().collect();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].ordinal, 1);
        assert!(retained[0].forced);
        assert_eq!(retained[0].rule, FORCED_RULE);
        assert_eq!(retained[0].tag, UnitTag::Program);
    }

    #[test]
    fn loss_prevention_ties_pick_first() {
        let mut units = vec![
            CodeUnit::new(&Block::new(0, "text", "aaaa"), UnitTag::Discard, "markup_block"),
            CodeUnit::new(&Block::new(1, "text", "bbbb"), UnitTag::Discard, "markup_block"),
        ];
        assert_eq!(retain_largest(&mut units), Some(0));
    }

    #[test]
    fn contradiction_discards_relaunch_under_kill_intent() {
        let blocks = vec![Block::new(
            0,
            "bash",
            "#!/bin/bash\npkill -f counter\nnohup python3 counter.py > /dev/null 2>&1 &\necho $! > counter.pid",
        )];
        let result = classify_all("kill the infinite counter", &blocks);
        assert!(result.contradiction);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("nohup"));
        assert_eq!(result.units[0].rule, CONTRADICTION_RULE);
    }

    #[test]
    fn no_contradiction_without_destructive_intent() {
        let blocks = vec![Block::new(
            0,
            "bash",
            "#!/bin/bash\nnohup python3 server.py &\necho started",
        )];
        let result = classify_all("start a web server in the background", &blocks);
        assert!(!result.contradiction);
        assert!(result.warnings.is_empty());
        assert!(result.has_retained());
    }

    #[test]
    fn contradiction_keeps_clean_siblings() {
        let blocks = vec![
            Block::new(0, "python", "import os\nos.system('pkill -f counter')"),
            Block::new(1, "bash", "systemctl start counter"),
        ];
        let result = classify_all("stop the counter process", &blocks);
        assert!(!result.contradiction);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.retained().count(), 1);
    }
}
