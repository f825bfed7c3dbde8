use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

const SOURCE_DIRS: [&str; 4] = ["analysis", "cli", "tests", "benches"];

const FORBIDDEN_MARKERS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// A source-level policy checked line by line.
#[derive(Clone, Copy)]
enum Rule {
    UnderscoreBinding,
    ForbiddenMarker,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscoreBinding,
        Rule::ForbiddenMarker,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> String {
        match self {
            Rule::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenMarker => format!(r"(//|/\*).*(?:{})", FORBIDDEN_MARKERS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::UppercaseComment => r"(//|/\*).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    /// Whether a line the pattern matched is a real violation.
    fn confirms(self, line: &str) -> bool {
        match self {
            Rule::UnderscoreBinding => !is_comment(line) && !underscore_in_string(line),
            Rule::ForbiddenMarker | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::UppercaseComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Rule::ForbiddenMarker => {
                "Comments must not carry change markers such as FIX, NEW or UPDATE. Remove them."
            }
            Rule::StarsInComment => "The '**' pattern is only allowed in doc comments.",
            Rule::UppercaseComment => "Comments written entirely in uppercase are not allowed.",
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed. Use the code or remove it."
            }
        }
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*')
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

fn underscore_in_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim_start_matches(['/', '!']).trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

/// Collects the confirmed violations of one rule in one file.
struct LineCollector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.confirms(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn scan_file(
    path: &Path,
    matchers: &[(Rule, RegexMatcher)],
    searcher: &mut Searcher,
) -> Result<Vec<String>, Box<dyn Error>> {
    let mut report = Vec::new();
    for (rule, matcher) in matchers {
        let mut collector = LineCollector {
            rule: *rule,
            violations: Vec::new(),
        };
        searcher.search_path(matcher, path, &mut collector)?;
        if collector.violations.is_empty() {
            continue;
        }
        report.push(format!(
            "\n❌ ERROR: {} violation(s) in {}:",
            collector.violations.len(),
            path.display()
        ));
        report.extend(collector.violations.iter().map(|v| format!("   {v}")));
        report.push(format!("⚠️ {}", rule.explanation()));
    }
    Ok(report)
}

fn scan_sources() -> Result<Vec<String>, Box<dyn Error>> {
    let matchers = Rule::ALL
        .iter()
        .map(|&rule| Ok((rule, RegexMatcher::new_line_matcher(&rule.pattern())?)))
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    let mut searcher = Searcher::new();
    let mut report = Vec::new();

    for dir in SOURCE_DIRS {
        for entry in WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        {
            report.extend(scan_file(entry.path(), &matchers, &mut searcher)?);
        }
    }
    Ok(report)
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }
    println!("cargo:rerun-if-env-changed=REARREST_RELEASE_TAG");

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=REARREST_BUILD_TIMESTAMP={timestamp}");

    match scan_sources() {
        Ok(report) if report.is_empty() => {}
        Ok(report) => {
            eprintln!("{}", report.join("\n"));
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
