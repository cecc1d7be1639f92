//! printf-style message interpolation

use serde_json::Value;

const TOKENS: &[char] = &['s', 'd', 'i', 'f', 'j', 'o', 'O', '%'];

/// Count placeholder tokens (`%s %d %i %f %j %o %O %%`) in `message`.
pub fn count_tokens(message: &str) -> usize {
    let mut count = 0;
    let mut chars = message.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            if let Some(next) = chars.clone().next() {
                if TOKENS.contains(&next) {
                    count += 1;
                    chars.next();
                }
            }
        }
    }
    count
}

/// Interpolate `args` into `message`. `%%` renders a literal percent sign
/// without consuming an argument; arguments left over are appended,
/// separated by spaces.
pub fn format_message(message: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(message.len());
    let mut args = args.iter();
    let mut chars = message.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(&token) = chars.peek() else {
            out.push(c);
            break;
        };
        if token == '%' {
            chars.next();
            out.push('%');
            continue;
        }
        if !TOKENS.contains(&token) {
            out.push(c);
            continue;
        }
        match args.next() {
            Some(arg) => {
                chars.next();
                out.push_str(&render_token(token, arg));
            }
            None => out.push(c),
        }
    }

    for arg in args {
        out.push(' ');
        out.push_str(&display(arg));
    }
    out
}

fn render_token(token: char, arg: &Value) -> String {
    match token {
        's' => display(arg),
        'd' | 'i' => match to_number(arg) {
            Some(n) if token == 'i' || n.fract() == 0.0 => format!("{}", n.trunc() as i64),
            Some(n) => format!("{}", n),
            None => "NaN".to_string(),
        },
        'f' => match to_number(arg) {
            Some(n) => format!("{}", n),
            None => "NaN".to_string(),
        },
        'j' | 'o' | 'O' => arg.to_string(),
        _ => display(arg),
    }
}

/// Strings render raw, everything else as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}
