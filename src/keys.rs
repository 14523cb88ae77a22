//! X11 keysym translation for planner key names.

pub const XK_BACKSPACE: u32 = 0xff08;
pub const XK_TAB: u32 = 0xff09;
pub const XK_RETURN: u32 = 0xff0d;
pub const XK_ESCAPE: u32 = 0xff1b;
pub const XK_DELETE: u32 = 0xffff;
pub const XK_HOME: u32 = 0xff50;
pub const XK_LEFT: u32 = 0xff51;
pub const XK_UP: u32 = 0xff52;
pub const XK_RIGHT: u32 = 0xff53;
pub const XK_DOWN: u32 = 0xff54;
pub const XK_PAGE_UP: u32 = 0xff55;
pub const XK_PAGE_DOWN: u32 = 0xff56;
pub const XK_END: u32 = 0xff57;
pub const XK_INSERT: u32 = 0xff63;
pub const XK_F1: u32 = 0xffbe;
pub const XK_SHIFT_L: u32 = 0xffe1;
pub const XK_CONTROL_L: u32 = 0xffe3;
pub const XK_META_L: u32 = 0xffe7;
pub const XK_ALT_L: u32 = 0xffe9;
pub const XK_SUPER_L: u32 = 0xffeb;

/// Keysym for a single named key or character, case-insensitive.
pub fn keysym_for_name(name: &str) -> Option<u32> {
    let lower = name.trim().to_lowercase();
    let sym = match lower.as_str() {
        "control" | "ctrl" => XK_CONTROL_L,
        "shift" => XK_SHIFT_L,
        "alt" | "option" => XK_ALT_L,
        "meta" => XK_META_L,
        "super" | "cmd" | "command" | "win" | "windows" => XK_SUPER_L,
        "enter" | "return" => XK_RETURN,
        "tab" => XK_TAB,
        "escape" | "esc" => XK_ESCAPE,
        "backspace" => XK_BACKSPACE,
        "delete" | "del" => XK_DELETE,
        "space" => 0x0020,
        "insert" | "ins" => XK_INSERT,
        "home" => XK_HOME,
        "end" => XK_END,
        "pageup" | "page_up" | "pgup" => XK_PAGE_UP,
        "pagedown" | "page_down" | "pgdn" => XK_PAGE_DOWN,
        "up" | "arrowup" => XK_UP,
        "down" | "arrowdown" => XK_DOWN,
        "left" | "arrowleft" => XK_LEFT,
        "right" | "arrowright" => XK_RIGHT,
        "capslock" => 0xffe5,
        "printscreen" | "print" => 0xff61,
        "pause" => 0xff13,
        "menu" => 0xff67,
        s if s.len() > 1 && s.starts_with('f') => {
            let n: u32 = s[1..].parse().ok()?;
            if !(1..=24).contains(&n) {
                return None;
            }
            XK_F1 + (n - 1)
        }
        _ => {
            // single characters keep their original case
            let mut chars = name.trim().chars();
            let c = chars.next()?;
            if chars.next().is_some() {
                return None;
            }
            keysym_for_char(c)
        }
    };
    Some(sym)
}

pub fn keysym_for_char(c: char) -> u32 {
    match c {
        '\n' | '\r' => XK_RETURN,
        '\t' => XK_TAB,
        '\u{8}' => XK_BACKSPACE,
        c if (' '..='~').contains(&c) || ('\u{a0}'..='\u{ff}').contains(&c) => c as u32,
        c => 0x0100_0000 | c as u32,
    }
}

/// Parse a chord such as `control+shift+t` into keysyms in press order.
pub fn parse_combo(combo: &str) -> Result<Vec<u32>, String> {
    let trimmed = combo.trim();
    if trimmed.is_empty() {
        return Err("empty key combination".into());
    }
    // a lone "+" is the plus key, not a separator
    if trimmed == "+" {
        return Ok(vec!['+' as u32]);
    }
    trimmed
        .split(['+', '-'])
        .filter(|p| !p.is_empty())
        .map(|part| {
            keysym_for_name(part)
                .ok_or_else(|| format!("unknown key {part:?} in combination {combo:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_chord() {
        assert_eq!(
            parse_combo("control+shift+t").unwrap(),
            vec![XK_CONTROL_L, XK_SHIFT_L, 't' as u32]
        );
        assert_eq!(parse_combo("Ctrl-A").unwrap(), vec![XK_CONTROL_L, 'A' as u32]);
    }

    #[test]
    fn named_keys() {
        assert_eq!(keysym_for_name("Enter"), Some(XK_RETURN));
        assert_eq!(keysym_for_name("pgdn"), Some(XK_PAGE_DOWN));
        assert_eq!(keysym_for_name("f5"), Some(XK_F1 + 4));
        assert_eq!(keysym_for_name("f25"), None);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = parse_combo("control+hyper").unwrap_err();
        assert!(err.contains("hyper"));
        assert!(parse_combo("  ").is_err());
    }

    #[test]
    fn characters_outside_latin1_use_unicode_keysyms() {
        assert_eq!(keysym_for_char('a'), 0x61);
        assert_eq!(keysym_for_char('é'), 0xe9);
        assert_eq!(keysym_for_char('€'), 0x0100_20ac);
        assert_eq!(keysym_for_char('\n'), XK_RETURN);
    }
}
