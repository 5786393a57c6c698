/// Static Source Screening
///
/// Cheap checks run on submitted source before a job is ever queued.
/// Nothing here executes or parses Python properly; both checks are textual
/// and deliberately conservative.
///
/// - Blacklist: case-insensitive substring match against tokens tied to
///   process spawning, raw sockets and FFI. Substring semantics mean
///   `execute` also trips `exec`; false positives are accepted.
/// - Import allow-list: top-level `import` / `from ... import` statements
///   must name an allowed root module. The runner enforces the same list at
///   runtime, so this only saves a sandbox round-trip.

/// Tokens whose presence rejects a submission outright
pub const BLACKLISTED_TOKENS: &[&str] = &[
    "fork",
    "exec",
    "socket",
    "_ctypes",
    "subprocess",
    "spawn",
    "execfile",
    "execsync",
    "spawnsync",
];

/// Return every blacklisted token found in `source`, in list order
pub fn find_blacklisted_tokens(source: &str) -> Vec<&'static str> {
    let lowered = source.to_lowercase();
    BLACKLISTED_TOKENS
        .iter()
        .copied()
        .filter(|token| lowered.contains(token))
        .collect()
}

/// Check import statements against `allowed_modules`.
/// Returns one human-readable issue per offending import.
pub fn check_imports(source: &str, allowed_modules: &[String]) -> Vec<String> {
    let mut issues = Vec::new();

    for line in source.lines() {
        // Statements separated by ';' on one line
        for statement in line.split(';') {
            let statement = strip_comment(statement).trim();

            if let Some(rest) = statement.strip_prefix("import ") {
                for item in rest.split(',') {
                    let module = item.trim().split_whitespace().next().unwrap_or("");
                    check_module(module, allowed_modules, "Import of", &mut issues);
                }
            } else if let Some(rest) = statement.strip_prefix("from ") {
                let module = rest.split_whitespace().next().unwrap_or("");
                // Relative imports have nothing to resolve against in a single-file sandbox
                if module.starts_with('.') {
                    issues.push("Relative imports are not allowed".to_string());
                    continue;
                }
                check_module(module, allowed_modules, "Import from", &mut issues);
            }
        }
    }

    issues
}

fn check_module(module: &str, allowed_modules: &[String], verb: &str, issues: &mut Vec<String>) {
    let root = module.split('.').next().unwrap_or("");
    if root.is_empty() {
        return;
    }
    if !allowed_modules.iter().any(|allowed| allowed == root) {
        issues.push(format!("{} module '{}' is not allowed", verb, root));
    }
}

fn strip_comment(statement: &str) -> &str {
    match statement.find('#') {
        Some(idx) => &statement[..idx],
        None => statement,
    }
}
