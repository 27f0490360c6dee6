use std::collections::HashMap;

/// Parse a `.param` file. Each non-comment line is `NAME,VALUE`; lines
/// starting with `#` and blank lines are skipped.
pub fn parse_param_file(contents: &str) -> Result<HashMap<String, f32>, String> {
    let mut result = HashMap::new();
    for (line_num, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, ',').collect();
        if parts.len() != 2 {
            return Err(format!("line {}: expected NAME,VALUE", line_num + 1));
        }
        let name = parts[0].trim();
        let value: f32 = parts[1]
            .trim()
            .parse()
            .map_err(|_| format!("line {}: invalid value '{}'", line_num + 1, parts[1].trim()))?;
        result.insert(name.to_string(), value);
    }
    Ok(result)
}

/// Format a keyed parameter snapshot as a `.param` file, sorted alphabetically.
pub fn format_param_file(params: &HashMap<String, f32>) -> String {
    let mut names: Vec<&String> = params.keys().collect();
    names.sort();
    let mut output = String::new();
    for name in names {
        output.push_str(&format!("{},{}\n", name, params[name]));
    }
    output
}
