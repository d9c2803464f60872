//! `${{ ... }}` template interpolation.
//!
//! Used for rule failure messages (`${{ trade_id }}` resolves against the failing row) and by
//! collaborators that template paths from run parameters.

/// Replaces every `${{ expression }}` with the resolver's value for the trimmed expression.
///
/// Unresolvable expressions render as empty strings. An unterminated marker is kept verbatim.
pub fn interpolate(input: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut remaining = input;

    while let Some(start) = remaining.find("${{") {
        let (before, after) = remaining.split_at(start);
        output.push_str(before);

        let Some(end) = after.find("}}") else {
            output.push_str(after);
            return output;
        };
        let expression = after[3..end].trim();
        output.push_str(&resolve(expression).unwrap_or_default());
        remaining = &after[end + 2..];
    }

    output.push_str(remaining);
    output
}
