//! Escape-mode aware text styling.
//!
//! Prompts and error reports are styled once and rendered three ways:
//! stripped (`none`), ANSI SGR sequences (`ansi`) or HTML spans (`html`).

use std::fmt::Write as _;

use bitflags::bitflags;
use crossterm::style::{Attribute, Color, SetAttribute, SetBackgroundColor, SetForegroundColor};
use crossterm::Command;

use crate::config::EscapeMode;

bitflags! {
    /// Text attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StyleFlags: u8 {
        const BOLD = 0b0000_0001;
        const DIM = 0b0000_0010;
        const ITALIC = 0b0000_0100;
        const UNDERLINE = 0b0000_1000;
        const REVERSE = 0b0001_0000;
    }
}

impl StyleFlags {
    /// Flag for an SGR-style digit (1 bold, 2 dim, 3 italic, 4 underline, 7 reverse)
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            1 => Some(Self::BOLD),
            2 => Some(Self::DIM),
            3 => Some(Self::ITALIC),
            4 => Some(Self::UNDERLINE),
            7 => Some(Self::REVERSE),
            _ => None,
        }
    }
}

/// Foreground, background and attributes; `None` colors mean terminal default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub fg: Option<u8>,
    pub bg: Option<u8>,
    pub flags: StyleFlags,
}

impl Style {
    pub const fn fg(index: u8) -> Self {
        Self {
            fg: Some(index),
            bg: None,
            flags: StyleFlags::empty(),
        }
    }

    pub fn with(mut self, flags: StyleFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_plain(&self) -> bool {
        self.fg.is_none() && self.bg.is_none() && self.flags.is_empty()
    }

    /// Style used for error reports
    pub fn error() -> Self {
        Self::fg(1).with(StyleFlags::BOLD)
    }

    /// Style used for warnings
    pub fn warning() -> Self {
        Self::fg(3)
    }
}

/// The sixteen palette colors addressable from prompt escapes
const PALETTE: [(Color, &str); 16] = [
    (Color::Black, "black"),
    (Color::DarkRed, "maroon"),
    (Color::DarkGreen, "green"),
    (Color::DarkYellow, "olive"),
    (Color::DarkBlue, "navy"),
    (Color::DarkMagenta, "purple"),
    (Color::DarkCyan, "teal"),
    (Color::Grey, "silver"),
    (Color::DarkGrey, "gray"),
    (Color::Red, "red"),
    (Color::Green, "lime"),
    (Color::Yellow, "yellow"),
    (Color::Blue, "blue"),
    (Color::Magenta, "fuchsia"),
    (Color::Cyan, "aqua"),
    (Color::White, "white"),
];

fn palette(index: u8) -> (Color, &'static str) {
    PALETTE[index as usize % PALETTE.len()]
}

/// Renders styles for one escape mode
#[derive(Debug, Clone, Copy)]
pub struct Markup {
    mode: EscapeMode,
}

impl Markup {
    pub fn new(mode: EscapeMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> EscapeMode {
        self.mode
    }

    /// Sequence that switches to `style`
    pub fn open(&self, style: &Style) -> String {
        let mut out = String::new();
        if style.is_plain() {
            return out;
        }
        match self.mode {
            EscapeMode::None => {}
            EscapeMode::Ansi => {
                let _ = write_ansi_style(&mut out, style);
            }
            EscapeMode::Html => {
                out.push_str("<span style=\"");
                if let Some(fg) = style.fg {
                    let _ = write!(out, "color:{};", palette(fg).1);
                }
                if let Some(bg) = style.bg {
                    let _ = write!(out, "background-color:{};", palette(bg).1);
                }
                if style.flags.contains(StyleFlags::BOLD) {
                    out.push_str("font-weight:bold;");
                }
                if style.flags.contains(StyleFlags::DIM) {
                    out.push_str("opacity:0.6;");
                }
                if style.flags.contains(StyleFlags::ITALIC) {
                    out.push_str("font-style:italic;");
                }
                if style.flags.contains(StyleFlags::UNDERLINE) {
                    out.push_str("text-decoration:underline;");
                }
                if style.flags.contains(StyleFlags::REVERSE) {
                    out.push_str("filter:invert(100%);");
                }
                out.push_str("\">");
            }
        }
        out
    }

    /// Sequence that ends a region opened with `style`
    pub fn close(&self, style: &Style) -> String {
        if style.is_plain() {
            return String::new();
        }
        match self.mode {
            EscapeMode::None => String::new(),
            EscapeMode::Ansi => {
                let mut out = String::new();
                let _ = SetAttribute(Attribute::Reset).write_ansi(&mut out);
                out
            }
            EscapeMode::Html => "</span>".to_string(),
        }
    }

    /// Literal text, escaped for the output mode
    pub fn text(&self, text: &str) -> String {
        match self.mode {
            EscapeMode::Html => {
                let mut out = String::with_capacity(text.len());
                for c in text.chars() {
                    match c {
                        '<' => out.push_str("&lt;"),
                        '>' => out.push_str("&gt;"),
                        '&' => out.push_str("&amp;"),
                        '"' => out.push_str("&quot;"),
                        _ => out.push(c),
                    }
                }
                out
            }
            _ => text.to_string(),
        }
    }

    /// `text` wrapped in `style`
    pub fn paint(&self, text: &str, style: &Style) -> String {
        format!("{}{}{}", self.open(style), self.text(text), self.close(style))
    }
}

fn write_ansi_style(out: &mut String, style: &Style) -> std::fmt::Result {
    // Start from a clean slate so a narrower style really narrows
    SetAttribute(Attribute::Reset).write_ansi(out)?;
    if let Some(fg) = style.fg {
        SetForegroundColor(palette(fg).0).write_ansi(out)?;
    }
    if let Some(bg) = style.bg {
        SetBackgroundColor(palette(bg).0).write_ansi(out)?;
    }
    let attributes = [
        (StyleFlags::BOLD, Attribute::Bold),
        (StyleFlags::DIM, Attribute::Dim),
        (StyleFlags::ITALIC, Attribute::Italic),
        (StyleFlags::UNDERLINE, Attribute::Underlined),
        (StyleFlags::REVERSE, Attribute::Reverse),
    ];
    for (flag, attribute) in attributes {
        if style.flags.contains(flag) {
            SetAttribute(attribute).write_ansi(out)?;
        }
    }
    Ok(())
}
