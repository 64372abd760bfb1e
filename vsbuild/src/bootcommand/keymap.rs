//! Characters and key names to USB HID usage codes (keyboard page, US layout).

/// HID usage of a printable character and whether shift is needed.
#[must_use]
pub fn char_usage(c: char) -> Option<(u8, bool)> {
    let usage = match c {
        'a'..='z' => (c as u8 - b'a' + 0x04, false),
        'A'..='Z' => (c as u8 - b'A' + 0x04, true),
        '1'..='9' => (c as u8 - b'1' + 0x1e, false),
        '0' => (0x27, false),
        '!' => (0x1e, true),
        '@' => (0x1f, true),
        '#' => (0x20, true),
        '$' => (0x21, true),
        '%' => (0x22, true),
        '^' => (0x23, true),
        '&' => (0x24, true),
        '*' => (0x25, true),
        '(' => (0x26, true),
        ')' => (0x27, true),
        '\n' => (0x28, false),
        '\t' => (0x2b, false),
        ' ' => (0x2c, false),
        '-' => (0x2d, false),
        '_' => (0x2d, true),
        '=' => (0x2e, false),
        '+' => (0x2e, true),
        '[' => (0x2f, false),
        '{' => (0x2f, true),
        ']' => (0x30, false),
        '}' => (0x30, true),
        '\\' => (0x31, false),
        '|' => (0x31, true),
        ';' => (0x33, false),
        ':' => (0x33, true),
        '\'' => (0x34, false),
        '"' => (0x34, true),
        '`' => (0x35, false),
        '~' => (0x35, true),
        ',' => (0x36, false),
        '<' => (0x36, true),
        '.' => (0x37, false),
        '>' => (0x37, true),
        '/' => (0x38, false),
        '?' => (0x38, true),
        _ => return None,
    };
    Some(usage)
}

/// HID usage of a named special key such as `enter` or `f5`.
///
/// Names are matched case-insensitively.
#[must_use]
pub fn special_usage(name: &str) -> Option<u8> {
    let lower = name.to_ascii_lowercase();
    if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
        return (1..=12).contains(&n).then(|| 0x3a + n - 1);
    }
    let usage = match lower.as_str() {
        "enter" | "return" => 0x28,
        "esc" => 0x29,
        "bs" => 0x2a,
        "tab" => 0x2b,
        "spacebar" => 0x2c,
        "insert" => 0x49,
        "home" => 0x4a,
        "pageup" => 0x4b,
        "del" => 0x4c,
        "end" => 0x4d,
        "pagedown" => 0x4e,
        "right" => 0x4f,
        "left" => 0x50,
        "down" => 0x51,
        "up" => 0x52,
        "menu" => 0x65,
        "leftctrl" => 0xe0,
        "leftshift" => 0xe1,
        "leftalt" => 0xe2,
        "leftsuper" => 0xe3,
        "rightctrl" => 0xe4,
        "rightshift" => 0xe5,
        "rightalt" => 0xe6,
        "rightsuper" => 0xe7,
        _ => return None,
    };
    Some(usage)
}
