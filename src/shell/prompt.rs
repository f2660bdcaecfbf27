//! Prompt templates.
//!
//! Templates use `%` escapes:
//!
//! | Escape   | Expands to                                   |
//! |----------|----------------------------------------------|
//! | `%n`     | session name                                 |
//! | `%i`     | session index (`-` when unregistered)        |
//! | `%l`     | language name                                |
//! | `%v`     | language version                             |
//! | `%e`     | engine name                                  |
//! | `%s`     | script path (empty when interactive)         |
//! | `%%`     | a literal `%`                                |
//! | `%f<h>`  | foreground palette color (hex digit)         |
//! | `%b<h>`  | background palette color (hex digit)         |
//! | `%y<d>`  | attribute digit (1 bold ... 7 reverse, 0 off) |
//! | `%r`     | reset colors and attributes                  |
//!
//! Unknown escapes are copied through verbatim.

use unicode_width::UnicodeWidthStr;

use crate::config::EscapeMode;
use crate::console::markup::{Markup, Style, StyleFlags};

/// Values a prompt can refer to
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub name: String,
    pub index: Option<usize>,
    pub language: String,
    pub version: String,
    pub engine: String,
    pub script: Option<String>,
}

/// What the formatter expects after the character just consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expecting {
    Text,
    Escape,
    Foreground,
    Background,
    Attribute,
}

/// Stateful prompt renderer; remembers the width of the last primary prompt
pub struct PromptFormatter {
    markup: Markup,
    expecting: Expecting,
    style: Style,
    primary_width: usize,
}

struct Rendered {
    text: String,
    width: usize,
}

impl PromptFormatter {
    pub fn new(mode: EscapeMode) -> Self {
        Self {
            markup: Markup::new(mode),
            expecting: Expecting::Text,
            style: Style::default(),
            primary_width: 0,
        }
    }

    /// Render a primary prompt and remember its display width
    pub fn primary(&mut self, template: &str, ctx: &PromptContext) -> String {
        let rendered = self.render(template, ctx);
        self.primary_width = rendered.width;
        rendered.text
    }

    /// Render a continuation prompt right-aligned under the last primary one
    pub fn secondary(&mut self, template: &str, ctx: &PromptContext) -> String {
        let rendered = self.render(template, ctx);
        let pad = self.primary_width.saturating_sub(rendered.width);
        format!("{}{}", " ".repeat(pad), rendered.text)
    }

    pub fn primary_width(&self) -> usize {
        self.primary_width
    }

    fn render(&mut self, template: &str, ctx: &PromptContext) -> Rendered {
        self.expecting = Expecting::Text;
        self.style = Style::default();
        let mut out = Rendered {
            text: String::new(),
            width: 0,
        };

        for c in template.chars() {
            match self.expecting {
                Expecting::Text => {
                    if c == '%' {
                        self.expecting = Expecting::Escape;
                    } else {
                        self.literal(&mut out, c.encode_utf8(&mut [0; 4]));
                    }
                }
                Expecting::Escape => {
                    self.expecting = Expecting::Text;
                    match c {
                        'n' => self.literal(&mut out, &ctx.name),
                        'i' => {
                            let index = ctx.index.map_or_else(|| "-".to_string(), |i| i.to_string());
                            self.literal(&mut out, &index);
                        }
                        'l' => self.literal(&mut out, &ctx.language),
                        'v' => self.literal(&mut out, &ctx.version),
                        'e' => self.literal(&mut out, &ctx.engine),
                        's' => self.literal(&mut out, ctx.script.as_deref().unwrap_or("")),
                        '%' => self.literal(&mut out, "%"),
                        'f' => self.expecting = Expecting::Foreground,
                        'b' => self.expecting = Expecting::Background,
                        'y' => self.expecting = Expecting::Attribute,
                        'r' => self.restyle(&mut out, Style::default()),
                        other => {
                            self.literal(&mut out, "%");
                            self.literal(&mut out, other.encode_utf8(&mut [0; 4]));
                        }
                    }
                }
                Expecting::Foreground | Expecting::Background | Expecting::Attribute => {
                    let expecting = self.expecting;
                    self.expecting = Expecting::Text;
                    let Some(digit) = c.to_digit(16) else {
                        // Not an index after all: keep the character
                        self.literal(&mut out, c.encode_utf8(&mut [0; 4]));
                        continue;
                    };
                    let mut style = self.style;
                    match expecting {
                        Expecting::Foreground => style.fg = Some(digit as u8),
                        Expecting::Background => style.bg = Some(digit as u8),
                        _ if digit == 0 => style.flags = StyleFlags::empty(),
                        _ => {
                            if let Some(flag) = StyleFlags::from_digit(digit as u8) {
                                style.flags |= flag;
                            }
                        }
                    }
                    self.restyle(&mut out, style);
                }
            }
        }

        if self.expecting == Expecting::Escape {
            self.literal(&mut out, "%");
        }
        self.restyle(&mut out, Style::default());
        self.expecting = Expecting::Text;
        out
    }

    fn literal(&self, out: &mut Rendered, text: &str) {
        out.width += UnicodeWidthStr::width(text);
        out.text.push_str(&self.markup.text(text));
    }

    fn restyle(&mut self, out: &mut Rendered, style: Style) {
        if style == self.style {
            return;
        }
        out.text.push_str(&self.markup.close(&self.style));
        out.text.push_str(&self.markup.open(&style));
        self.style = style;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PromptContext {
        PromptContext {
            name: "sh".to_string(),
            index: Some(2),
            language: "calc".to_string(),
            version: "1.0".to_string(),
            engine: "cuf-calc".to_string(),
            script: None,
        }
    }

    #[test]
    fn test_plain_substitutions() {
        let mut fmt = PromptFormatter::new(EscapeMode::None);
        assert_eq!(fmt.primary("%n[%i]> ", &ctx()), "sh[2]> ");
        assert_eq!(fmt.primary("%l %v (%e)%% ", &ctx()), "calc 1.0 (cuf-calc)% ");
    }

    #[test]
    fn test_unregistered_index_and_unknown_escape() {
        let mut fmt = PromptFormatter::new(EscapeMode::None);
        let mut c = ctx();
        c.index = None;
        assert_eq!(fmt.primary("%i %q%", &c), "- %q%");
    }

    #[test]
    fn test_colors_stripped_in_none_mode() {
        let mut fmt = PromptFormatter::new(EscapeMode::None);
        assert_eq!(fmt.primary("%f9%y1%n%r> ", &ctx()), "sh> ");
    }

    #[test]
    fn test_ansi_colors() {
        let mut fmt = PromptFormatter::new(EscapeMode::Ansi);
        let prompt = fmt.primary("%f2%n%r> ", &ctx());
        assert!(prompt.starts_with("\x1b["));
        assert!(prompt.contains("sh"));
        assert!(prompt.ends_with("> "));
        // Escapes do not count toward the width
        assert_eq!(fmt.primary_width(), 4);
    }

    #[test]
    fn test_html_spans() {
        let mut fmt = PromptFormatter::new(EscapeMode::Html);
        let prompt = fmt.primary("%fc%n%r<", &ctx());
        assert_eq!(prompt, "<span style=\"color:blue;\">sh</span>&lt;");
    }

    #[test]
    fn test_secondary_aligned_to_primary() {
        let mut fmt = PromptFormatter::new(EscapeMode::None);
        let primary = fmt.primary("%n[%i]> ", &ctx());
        let secondary = fmt.secondary("> ", &ctx());
        assert_eq!(primary.len(), secondary.len());
        assert!(secondary.ends_with("> "));
    }

    #[test]
    fn test_secondary_uses_display_width() {
        let mut fmt = PromptFormatter::new(EscapeMode::None);
        let mut c = ctx();
        c.name = "日本".to_string();
        fmt.primary("%n> ", &c);
        assert_eq!(fmt.primary_width(), 6);
        assert_eq!(fmt.secondary("> ", &c), "    > ");
    }

    #[test]
    fn test_non_digit_after_color_escape() {
        let mut fmt = PromptFormatter::new(EscapeMode::None);
        assert_eq!(fmt.primary("%fz>", &ctx()), "z>");
    }
}
