//! Small REPL-facing helpers that aren't part of the storage core.

use once_cell::sync::Lazy;
use regex::Regex;

static STRUCTURAL_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\s*([{}\[\]:,])\s*"#).unwrap());
static BARE_KEY: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)"#).unwrap());

/// Rewrite a JS-object-literal-like string — bare, unquoted keys and
/// values, loose whitespace around `{`, `}`, `:` and `,` — into strict
/// JSON, so filters and row literals can be typed at the prompt without
/// fighting quoting rules.
///
/// Internal whitespace inside an unquoted value is preserved (`Super
/// Table` stays two words apart); whitespace touching structural
/// punctuation is trimmed. Values that already look like JSON (quoted
/// strings, numbers, nested objects/arrays, `true`/`false`/`null`) are
/// left alone.
pub fn convert_json(input: &str) -> String {
	let trimmed = trim_structural_whitespace(input.trim());
	let quoted_keys = quote_bare_keys(&trimmed);
	quote_bare_values(&quoted_keys)
}

/// Drop whitespace runs that touch `{`, `}`, `[`, `]`, `:` or `,`. Whitespace
/// strictly between two non-structural characters (the inside of a bare
/// multi-word value) is left untouched.
fn trim_structural_whitespace(input: &str) -> String {
	STRUCTURAL_WHITESPACE.replace_all(input, "$1").into_owned()
}

fn quote_bare_keys(input: &str) -> String {
	// A bare key is a word run that starts right after `{` or `,` (modulo
	// whitespace) and ends at `:`; it is left alone if already quoted.
	BARE_KEY.replace_all(input, r#"$1"$2"$3"#).into_owned()
}

fn is_bare_value_start(c: char) -> bool {
	!matches!(c, '"' | '{' | '[' | ' ' | '\t' | '\n' | '\r')
}

fn looks_like_number(s: &str) -> bool {
	!s.is_empty() && s.parse::<i64>().is_ok()
}

fn looks_like_keyword(s: &str) -> bool {
	matches!(s, "true" | "false" | "null")
}

/// Scan past `:`-introduced values, quoting any bare word run that is not
/// already valid JSON (a quoted string, a number, a keyword, or a nested
/// object/array).
fn quote_bare_values(input: &str) -> String {
	let chars: Vec<char> = input.chars().collect();
	let mut out = String::with_capacity(input.len() + 8);
	let mut i = 0;
	while i < chars.len() {
		let c = chars[i];
		out.push(c);
		if c == ':' {
			i += 1;
			while i < chars.len() && chars[i].is_whitespace() {
				i += 1;
			}
			if i < chars.len() && is_bare_value_start(chars[i]) {
				let start = i;
				let mut depth = 0i32;
				while i < chars.len() {
					let cc = chars[i];
					if cc == '{' || cc == '[' {
						depth += 1;
					} else if cc == '}' || cc == ']' {
						if depth == 0 {
							break;
						}
						depth -= 1;
					} else if cc == ',' && depth == 0 {
						break;
					}
					i += 1;
				}
				let raw = chars[start..i].iter().collect::<String>();
				let trimmed = raw.trim();
				if looks_like_number(trimmed) || looks_like_keyword(trimmed) {
					out.push_str(trimmed);
				} else {
					out.push('"');
					out.push_str(trimmed);
					out.push('"');
				}
			}
			// Quoted strings, nested objects/arrays, or end of input: leave
			// `i` where it is so the next iteration pushes `chars[i]` as-is.
			continue;
		}
		i += 1;
	}
	out
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn quotes_a_single_bare_field() {
		assert_eq!(convert_json("{ name: Super   Table }"), r#"{"name":"Super   Table"}"#);
	}

	#[test]
	fn quotes_nested_keys_and_leaves_type_names_as_strings() {
		let input = "{ name:Super   Table, keys:{created_at:int, description: fff}}";
		let expected = r#"{"name":"Super   Table","keys":{"created_at":"int","description":"fff"}}"#;
		assert_eq!(convert_json(input), expected);
	}

	#[test]
	fn leaves_numbers_and_already_quoted_strings_alone() {
		assert_eq!(convert_json(r#"{content: 1, id: "aaa"}"#), r#"{"content":1,"id":"aaa"}"#);
	}

	#[test]
	fn handles_or_of_parts() {
		let input = "[{id: aaa}, {id: bbb}]";
		assert_eq!(convert_json(input), r#"[{"id":"aaa"},{"id":"bbb"}]"#);
	}
}
