use crate::model::Severity;
use regex::Regex;

/// One row of the classification table. Patterns are matched case-insensitively
/// against the normalized text.
#[derive(Debug, Clone, Copy)]
pub struct RuleSpec {
    pub category: &'static str,
    pub severity: Severity,
    pub patterns: &'static [&'static str],
    pub suggestions: &'static [&'static str],
    pub docs: &'static [&'static str],
}

pub const UNCLASSIFIED: &str = "UNCLASSIFIED";

/// Evaluated top to bottom, first match wins. Exception-name rules sit above
/// the keyword rules that would otherwise swallow them.
pub const DEFAULT_RULES: &[RuleSpec] = &[
    RuleSpec {
        category: "ASSERTION_FAILURE",
        severity: Severity::High,
        patterns: &[
            r"AssertionError",
            r"assert\w*\s.*failed",
            r"expected .* but .*got",
            r"assertion\s*error",
        ],
        suggestions: &[
            "Check if the expected value matches actual output",
            "Verify test data setup is correct",
            "Review recent code changes affecting this value",
            "Add debug logging to track value changes",
        ],
        docs: &[
            "https://docs.pytest.org/en/stable/how-to/assert.html",
            "https://docs.python.org/3/library/unittest.html#assert-methods",
        ],
    },
    RuleSpec {
        category: "IMPORT_ERROR",
        severity: Severity::Critical,
        patterns: &[
            r"ModuleNotFoundError",
            r"ImportError",
            r"cannot import",
            r"no module named",
            r"import .*failed",
        ],
        suggestions: &[
            "Install the missing package in the test environment",
            "Check that the package is listed in the project's requirements",
            "Verify the virtual environment is activated",
            "Check the module search path configuration",
        ],
        docs: &["https://packaging.python.org/tutorials/installing-packages/"],
    },
    RuleSpec {
        category: "SELENIUM_ERROR",
        severity: Severity::High,
        patterns: &[
            r"selenium\.common\.exceptions\.\w+",
            r"NoSuchElementException",
            r"StaleElementReferenceException",
            r"ElementNotInteractableException",
        ],
        suggestions: &[
            "Add explicit waits for element visibility",
            "Check if the element locator is correct",
            "Verify the page is fully loaded before interaction",
            "Handle dynamic content with WebDriverWait",
        ],
        docs: &[
            "https://selenium-python.readthedocs.io/waits.html",
            "https://www.selenium.dev/documentation/webdriver/waits/",
        ],
    },
    RuleSpec {
        category: "TIMEOUT_ERROR",
        severity: Severity::Medium,
        patterns: &[r"TimeoutError", r"TimeoutException", r"timed out", r"timeout"],
        suggestions: &[
            "Increase the timeout if the operation is legitimately slow",
            "Check for network or database connectivity issues",
            "Review performance of external dependencies",
            "Consider retry logic for operations known to be slow to settle",
        ],
        docs: &["https://docs.pytest.org/en/stable/how-to/failures.html"],
    },
    RuleSpec {
        category: "CONNECTION_ERROR",
        severity: Severity::High,
        patterns: &[
            r"ConnectionError",
            r"connection.*refused",
            r"connection.*reset",
            r"connection.*error",
            r"connection.*failed",
            r"cannot connect",
        ],
        suggestions: &[
            "Verify the service is running and accessible",
            "Confirm the host and port configuration",
            "Check network connectivity and firewall rules",
            "Review service health checks and startup time",
            "Add a retry with exponential backoff",
        ],
        docs: &["https://requests.readthedocs.io/en/latest/user/advanced/#timeouts"],
    },
    RuleSpec {
        category: "NETWORK_ERROR",
        severity: Severity::High,
        patterns: &[
            r"network.*error",
            r"host.*unreachable",
            r"dns.*resolution.*failed",
            r"name or service not known",
            r"socket.*error",
        ],
        suggestions: &[
            "Check network connectivity from the test host",
            "Verify hostnames and URLs resolve",
            "Test access to the remote endpoint outside the suite",
        ],
        docs: &[],
    },
    RuleSpec {
        category: "PERMISSION_ERROR",
        severity: Severity::High,
        patterns: &[
            r"PermissionError",
            r"permission.*denied",
            r"access.*denied",
            r"insufficient.*privileges",
            r"SecurityException",
        ],
        suggestions: &[
            "Check file and directory permissions",
            "Run with appropriate user privileges",
            "Verify write access to the output directory",
            "Check for file locks held by other processes",
        ],
        docs: &["https://docs.python.org/3/library/exceptions.html#PermissionError"],
    },
    RuleSpec {
        category: "FILE_NOT_FOUND",
        severity: Severity::Medium,
        patterns: &[
            r"FileNotFoundError",
            r"no such file",
            r"file.*not.*found",
            r"path.*does.*not.*exist",
        ],
        suggestions: &[
            "Verify the file path is correct and the file exists",
            "Check the working directory in the test context",
            "Ensure fixtures create the files the test needs",
        ],
        docs: &["https://docs.python.org/3/library/pathlib.html"],
    },
    RuleSpec {
        category: "CONFIGURATION_ERROR",
        severity: Severity::Medium,
        patterns: &[
            r"config\w*.*error",
            r"configuration.*invalid",
            r"settings.*not.*found",
            r"yaml.*error",
            r"json\w*.*error",
        ],
        suggestions: &[
            "Validate configuration files and their syntax",
            "Verify environment-specific settings are present",
        ],
        docs: &[],
    },
    RuleSpec {
        category: "TYPE_CONVERSION_ERROR",
        severity: Severity::Medium,
        patterns: &[
            r"invalid literal for int\(\)",
            r"could not convert string to float",
        ],
        suggestions: &[
            "Validate input before type conversion",
            "Check the data source for invalid values",
            "Add a validation layer in front of parsing",
        ],
        docs: &["https://docs.python.org/3/library/functions.html#int"],
    },
    RuleSpec {
        category: "ATTRIBUTE_ERROR",
        severity: Severity::High,
        patterns: &[r"AttributeError", r"has no attribute", r"attribute.*not.*found"],
        suggestions: &[
            "Check the object type; it might be None or the wrong type",
            "Verify the attribute name spelling",
            "Review API changes in dependencies",
            "Check mock and fixture configuration",
        ],
        docs: &["https://docs.python.org/3/library/exceptions.html#AttributeError"],
    },
    RuleSpec {
        category: "KEY_ERROR",
        severity: Severity::Medium,
        patterns: &[r"KeyError", r"key.*not.*found", r"missing.*key"],
        suggestions: &[
            "Check that the key exists before accessing it",
            "Verify the data structure matches expectations",
            "Review the API response format",
        ],
        docs: &["https://docs.python.org/3/library/stdtypes.html#dict"],
    },
    RuleSpec {
        category: "INDEX_ERROR",
        severity: Severity::Low,
        patterns: &[r"IndexError", r"index.*out.*of.*range"],
        suggestions: &[
            "Check list bounds before indexing",
            "Verify the collection is populated as expected",
        ],
        docs: &[],
    },
    RuleSpec {
        category: "VALUE_ERROR",
        severity: Severity::Low,
        patterns: &[r"ValueError", r"invalid.*value"],
        suggestions: &[
            "Validate input values",
            "Review function parameters at the call site",
        ],
        docs: &[],
    },
    RuleSpec {
        category: "TYPE_ERROR",
        severity: Severity::Low,
        patterns: &[r"TypeError", r"unexpected.*type"],
        suggestions: &[
            "Verify argument types",
            "Review function signatures for recent changes",
        ],
        docs: &[],
    },
];

const GENERIC_SUGGESTIONS: &[&str] = &[
    "Review the full stack trace for more context",
    "Check recent code changes that might affect this test",
    "Add debug logging to identify the root cause",
    "Search for similar errors in project history",
];

/// Suggestions for text no rule matched, plus keyword-driven extras.
pub fn generic_suggestions(normalized: &str) -> Vec<String> {
    let lower = normalized.to_lowercase();
    let mut out: Vec<String> = GENERIC_SUGGESTIONS.iter().map(|s| s.to_string()).collect();
    if lower.contains("null") || lower.contains("none") {
        out.push("Add null/None checks before accessing properties".into());
    }
    if lower.contains("database") || lower.contains("sql") {
        out.push("Verify database connection and schema".into());
        out.push("Check transaction handling".into());
    }
    if lower.contains("api") {
        out.push("Verify API endpoint availability".into());
        out.push("Check request/response format".into());
    }
    out
}

#[derive(Debug)]
pub struct Rule {
    pub category: String,
    pub severity: Severity,
    pub suggestions: Vec<String>,
    pub docs: Vec<String>,
    matcher: Regex,
}

impl Rule {
    pub fn is_match(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }
}

#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(specs: &[RuleSpec]) -> Result<Self, regex::Error> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let alternation = spec
                .patterns
                .iter()
                .map(|p| format!("(?:{})", p))
                .collect::<Vec<_>>()
                .join("|");
            rules.push(Rule {
                category: spec.category.to_string(),
                severity: spec.severity,
                suggestions: spec.suggestions.iter().map(|s| s.to_string()).collect(),
                docs: spec.docs.iter().map(|s| s.to_string()).collect(),
                matcher: Regex::new(&format!("(?i){}", alternation))?,
            });
        }
        Ok(Self { rules })
    }

    pub fn defaults() -> Result<Self, regex::Error> {
        Self::compile(DEFAULT_RULES)
    }

    pub fn first_match(&self, text: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.is_match(text))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
