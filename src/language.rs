use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Cpp,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::Java,
        Language::Cpp,
        Language::JavaScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Java => "java",
            Self::Cpp => "cpp",
            Self::JavaScript => "javascript",
        }
    }

    /// Image used by the container backend when the config has no override
    pub fn default_image(&self) -> &'static str {
        match self {
            Self::Python => "python:3.11-slim",
            Self::Java => "eclipse-temurin:17-jdk-jammy",
            Self::Cpp => "gcc:12",
            Self::JavaScript => "node:18-slim",
        }
    }

    /// Language identifier understood by the remote execution service
    pub fn remote_name(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Java => "java",
            Self::Cpp => "c++",
            Self::JavaScript => "javascript",
        }
    }

    fn spec(&self) -> &'static LanguageSpec {
        match self {
            Self::Python => &PYTHON,
            Self::Java => &JAVA,
            Self::Cpp => &CPP,
            Self::JavaScript => &JAVASCRIPT,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Language::ALL
            .into_iter()
            .find(|l| l.as_str() == lowered)
            .ok_or_else(|| EngineError::UnsupportedLanguage(s.to_string()))
    }
}

/// Static per-language command templates.
///
/// `%INPUT%` is replaced by the source file name and `%OUTPUT%` by the
/// artifact name. Every path is relative to the step's working directory so
/// the same plan runs on the host, inside a container or inside a VM.
struct LanguageSpec {
    file_name: &'static str,
    compile: Option<&'static [&'static str]>,
    run: &'static [&'static str],
    artifact: Option<&'static str>,
}

static PYTHON: LanguageSpec = LanguageSpec {
    file_name: "solution.py",
    compile: None,
    run: &["python3", "%INPUT%"],
    artifact: None,
};

static JAVA: LanguageSpec = LanguageSpec {
    file_name: "Solution.java",
    compile: Some(&["javac", "%INPUT%"]),
    run: &["java", "-cp", ".", "Solution"],
    artifact: Some("Solution.class"),
};

static CPP: LanguageSpec = LanguageSpec {
    file_name: "solution.cpp",
    compile: Some(&["g++", "-std=c++17", "-O2", "-o", "%OUTPUT%", "%INPUT%"]),
    run: &["./%OUTPUT%"],
    artifact: Some("solution"),
};

static JAVASCRIPT: LanguageSpec = LanguageSpec {
    file_name: "solution.js",
    compile: None,
    run: &["node", "%INPUT%"],
    artifact: None,
};

/// One command of a build plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// File the step is expected to leave behind in `working_dir`
    pub artifact: Option<String>,
}

impl Step {
    /// Renders the step as a single POSIX shell command line
    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub language: Language,
    /// File name the source must be written to inside the working directory
    pub source_file: String,
    pub compile: Option<Step>,
    pub run: Step,
}

impl BuildPlan {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Caps managed runtime heaps at half of `memory_mib`, leaving the rest
    /// for the runtime itself. Without a cap the JVM sizes its heap from host
    /// memory and may not fit under the process limit at all.
    pub fn fit_memory(mut self, memory_mib: Option<u64>) -> Self {
        let Some(mib) = memory_mib else {
            return self;
        };
        let heap = (mib / 2).max(16);
        match self.language {
            Language::Java => {
                if let Some(compile) = self.compile.as_mut() {
                    compile.args.splice(
                        0..0,
                        ["-J-XX:+UseSerialGC".to_string(), format!("-J-Xmx{heap}m")],
                    );
                }
                self.run
                    .args
                    .splice(0..0, ["-XX:+UseSerialGC".to_string(), format!("-Xmx{heap}m")]);
            }
            Language::JavaScript => {
                self.run.args.insert(0, format!("--max-old-space-size={heap}"));
            }
            Language::Python | Language::Cpp => {}
        }
        self
    }
}

/// Maps a language to its compile and run steps rooted at `working_dir`.
///
/// Pure: nothing is touched on disk.
pub fn resolve(language: Language, working_dir: &Path) -> BuildPlan {
    let spec = language.spec();
    let artifact = spec.artifact.unwrap_or(spec.file_name);

    let mut mapping = HashMap::<&str, &str>::new();
    mapping.insert("%INPUT%", spec.file_name);
    mapping.insert("%OUTPUT%", artifact);

    let compile = spec.compile.map(|template| {
        let mut command = apply_template(template, &mapping);
        let program = command.remove(0);
        Step {
            program,
            args: command,
            working_dir: working_dir.to_path_buf(),
            artifact: spec.artifact.map(str::to_string),
        }
    });

    let mut command = apply_template(spec.run, &mapping);
    let program = command.remove(0);

    BuildPlan {
        language,
        source_file: spec.file_name.to_string(),
        compile,
        run: Step {
            program,
            args: command,
            working_dir: working_dir.to_path_buf(),
            artifact: None,
        },
    }
}

fn apply_template(template: &[&str], mapping: &HashMap<&str, &str>) -> Vec<String> {
    template
        .iter()
        .map(|s| {
            let mut t = s.to_string();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}

pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+:,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interpreted_languages_have_single_step() {
        let dir = Path::new("/work");
        let plan = resolve(Language::Python, dir);
        assert!(!plan.is_compiled());
        assert_eq!(plan.source_file, "solution.py");
        assert_eq!(plan.run.program, "python3");
        assert_eq!(plan.run.args, vec!["solution.py"]);
        assert_eq!(plan.run.working_dir, dir);

        let plan = resolve(Language::JavaScript, dir);
        assert!(!plan.is_compiled());
        assert_eq!(plan.run.program, "node");
        assert_eq!(plan.run.args, vec!["solution.js"]);
    }

    #[test]
    fn test_compiled_languages_have_compile_then_run() {
        let dir = Path::new("/work");
        let plan = resolve(Language::Cpp, dir);
        let compile = plan.compile.expect("cpp compiles");
        assert_eq!(compile.program, "g++");
        assert_eq!(
            compile.args,
            vec!["-std=c++17", "-O2", "-o", "solution", "solution.cpp"]
        );
        assert_eq!(compile.artifact.as_deref(), Some("solution"));
        assert_eq!(plan.run.program, "./solution");

        let plan = resolve(Language::Java, dir);
        assert_eq!(plan.source_file, "Solution.java");
        let compile = plan.compile.expect("java compiles");
        assert_eq!(compile.program, "javac");
        assert_eq!(plan.run.args, vec!["-cp", ".", "Solution"]);
    }

    #[test]
    fn test_managed_heaps_fit_memory_limit() {
        let dir = Path::new("/work");
        let plan = resolve(Language::Java, dir).fit_memory(Some(512));
        assert_eq!(
            plan.compile.unwrap().args,
            vec!["-J-XX:+UseSerialGC", "-J-Xmx256m", "Solution.java"]
        );
        assert_eq!(
            plan.run.args,
            vec!["-XX:+UseSerialGC", "-Xmx256m", "-cp", ".", "Solution"]
        );

        let plan = resolve(Language::JavaScript, dir).fit_memory(Some(512));
        assert_eq!(plan.run.args, vec!["--max-old-space-size=256", "solution.js"]);

        assert_eq!(
            resolve(Language::Cpp, dir).fit_memory(Some(512)),
            resolve(Language::Cpp, dir)
        );
        assert_eq!(
            resolve(Language::Java, dir).fit_memory(None),
            resolve(Language::Java, dir)
        );
    }

    #[test]
    fn test_unsupported_language_fails() {
        let err = "brainfuck".parse::<Language>().unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedLanguage(ref l) if l == "brainfuck"));
    }

    #[test]
    fn test_language_names_round_trip() {
        for language in Language::ALL {
            assert_eq!(language.as_str().parse::<Language>().unwrap(), language);
        }
        assert_eq!("  Python ".parse::<Language>().unwrap(), Language::Python);
        assert_eq!(Language::Cpp.remote_name(), "c++");
    }

    #[test]
    fn test_shell_rendering() {
        let step = Step {
            program: "g++".into(),
            args: vec!["-o".into(), "a b".into(), "it's".into()],
            working_dir: PathBuf::from("/work"),
            artifact: None,
        };
        assert_eq!(step.to_shell(), r"g++ -o 'a b' 'it'\''s'");
    }
}
