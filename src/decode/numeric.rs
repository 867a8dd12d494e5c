// src/decode/numeric.rs
//
// Separator-delimited line decoding.
// Malformed fragments are skipped; they never abort the line.

/// Split a framed line into its non-empty fields.
///
/// The line is trimmed, split on `separator`, and fragments that are empty or
/// whitespace-only are dropped. Surviving fragments are returned untouched.
pub fn split_fields<'a>(line: &'a str, separator: &str) -> Vec<&'a str> {
    let clean = line.trim();
    if clean.is_empty() {
        return Vec::new();
    }
    if separator.is_empty() {
        return vec![clean];
    }
    clean
        .split(separator)
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// Decode a line of separator-delimited numbers.
///
/// Each fragment contributes its leading number, so unit suffixes such as
/// `1.5V` still yield a value. Fragments with no leading number are dropped;
/// the order of the valid values is preserved. An empty result means the line
/// carried no usable value.
pub fn parse_numeric_row(line: &str, separator: &str) -> Vec<f64> {
    split_fields(line, separator)
        .into_iter()
        .filter_map(parse_float_prefix)
        .collect()
}

/// Longest decimal number at the start of `text`, after leading whitespace.
///
/// Accepts a sign, digits with at most one point, and an exponent when digits
/// follow it, plus the literal `Infinity`. Anything after the number is
/// ignored. `nan`, `inf` and hex forms are not numbers here.
pub fn parse_float_prefix(text: &str) -> Option<f64> {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let mut end = sign_len(bytes);

    if s[end..].starts_with("Infinity") {
        return Some(if s.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY });
    }

    let int_digits = digit_run(&bytes[end..]);
    end += int_digits;
    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = digit_run(&bytes[end + 1..]);
        if int_digits + frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }
    if int_digits + frac_digits == 0 {
        return None;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let exp_sign = sign_len(&bytes[end + 1..]);
        let exp_digits = digit_run(&bytes[end + 1 + exp_sign..]);
        if exp_digits > 0 {
            end += 1 + exp_sign + exp_digits;
        }
    }

    s[..end].parse::<f64>().ok()
}

/// Leading integer of `text`, after leading whitespace. Trailing text,
/// including a fractional part, is ignored.
pub fn parse_int_prefix(text: &str) -> Option<i64> {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let sign = sign_len(bytes);
    let digits = digit_run(&bytes[sign..]);
    if digits == 0 {
        return None;
    }
    s[..sign + digits].parse::<i64>().ok()
}

fn sign_len(bytes: &[u8]) -> usize {
    usize::from(matches!(bytes.first(), Some(b'+' | b'-')))
}

fn digit_run(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_fragment_dropped() {
        assert_eq!(parse_numeric_row("1:2:x:3", ":"), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_whitespace_and_empty_fragments() {
        assert_eq!(parse_numeric_row("  1.5 :: -2e3 :  \r", ":"), vec![1.5, -2000.0]);
        assert!(parse_numeric_row("", ":").is_empty());
        assert!(parse_numeric_row(":::", ":").is_empty());
    }

    #[test]
    fn test_nan_is_not_a_value() {
        assert_eq!(parse_numeric_row("NaN,4", ","), vec![4.0]);
    }

    #[test]
    fn test_unit_suffixes_keep_leading_number() {
        assert_eq!(parse_numeric_row("1.5V:23C:7", ":"), vec![1.5, 23.0, 7.0]);
        assert_eq!(parse_numeric_row("-4.e2x,.5,5.", ","), vec![-400.0, 0.5, 5.0]);
        assert_eq!(parse_numeric_row("2e:3e+:1e-2", ":"), vec![2.0, 3.0, 0.01]);
    }

    #[test]
    fn test_only_decimal_spellings_are_numbers() {
        assert_eq!(parse_numeric_row("inf:nan:0x10:-Infinity:.:-", ":"), vec![0.0, f64::NEG_INFINITY]);
        assert_eq!(parse_float_prefix("Infinityx"), Some(f64::INFINITY));
    }

    #[test]
    fn test_int_prefix() {
        assert_eq!(parse_int_prefix(" 12.7"), Some(12));
        assert_eq!(parse_int_prefix("-3rows"), Some(-3));
        assert_eq!(parse_int_prefix("+"), None);
        assert_eq!(parse_int_prefix("x1"), None);
    }

    #[test]
    fn test_multichar_separator() {
        assert_eq!(parse_numeric_row("1<>2<>3", "<>"), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_split_fields_keeps_text() {
        assert_eq!(split_fields(" a:b : :c ", ":"), vec!["a", "b ", "c"]);
    }

    #[test]
    fn test_empty_separator_keeps_whole_line() {
        assert_eq!(split_fields(" 12 ", ""), vec!["12"]);
        assert_eq!(parse_numeric_row(" 12 ", ""), vec![12.0]);
    }
}
