use std::fmt;

use logos::Logos;

mod source_map;

pub use source_map::{SourceMap, normalize_newlines};

use crate::error::{Result, ScriptError};

/// Token tags seen by the compiler. Keywords are resolved by the
/// [`Lexer`] wrapper rather than by logos so that a name following `.`
/// can stay an identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),

    // Keywords
    If,
    Else,
    New,
    Instanceof,
    Typeof,
    Delete,
    Int,
    Real,
    String,
    Switch,
    Case,
    Default,
    Function,
    Return,
    Class,
    Break,
    Continue,
    This,
    Super,
    True,
    False,
    Global,
    For,
    While,
    Do,
    Var,

    // Operators and punctuation
    Comma,
    Assign,
    Eq,
    StrictEq,
    Arrow,
    BitAnd,
    And,
    AndAssign,
    BitAndAssign,
    BitOr,
    Or,
    OrAssign,
    BitOrAssign,
    BitXor,
    BitXorAssign,
    Add,
    AddAssign,
    Inc,
    Sub,
    SubAssign,
    Dec,
    Mod,
    ModAssign,
    DictOpen,
    Div,
    DivAssign,
    IntDiv,
    IntDivAssign,
    Mul,
    MulAssign,
    Gt,
    Shr,
    ShrAssign,
    Ge,
    Lt,
    Shl,
    ShlAssign,
    Le,
    Question,
    Colon,
    Not,
    NotEq,
    StrictNotEq,
    BitNot,
    Hash,
    Dollar,
    Semicolon,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    End,
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\n\x0B\x0C]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
enum Raw<'src> {
    /// Only matches when the comment never closes.
    #[token("/*")]
    OpenComment,

    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", |lex| lex.slice())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice())]
    Number(&'src str),

    #[regex(r#""([^"\\\n]|\\[^\n])*""#, |lex| lex.slice())]
    #[regex(r#"'([^'\\\n]|\\[^\n])*'"#, |lex| lex.slice())]
    Str(&'src str),

    #[regex(r#""([^"\\\n]|\\[^\n])*\\?"#)]
    #[regex(r#"'([^'\\\n]|\\[^\n])*\\?"#)]
    OpenStr,

    #[regex(r"[A-Za-z_\x{80}-\x{10FFFF}][A-Za-z0-9_\x{80}-\x{10FFFF}]*", |lex| lex.slice())]
    Ident(&'src str),

    #[token(",", |_| TokenKind::Comma)]
    #[token("=", |_| TokenKind::Assign)]
    #[token("==", |_| TokenKind::Eq)]
    #[token("===", |_| TokenKind::StrictEq)]
    #[token("=>", |_| TokenKind::Arrow)]
    #[token("&", |_| TokenKind::BitAnd)]
    #[token("&&", |_| TokenKind::And)]
    #[token("&&=", |_| TokenKind::AndAssign)]
    #[token("&=", |_| TokenKind::BitAndAssign)]
    #[token("|", |_| TokenKind::BitOr)]
    #[token("||", |_| TokenKind::Or)]
    #[token("||=", |_| TokenKind::OrAssign)]
    #[token("|=", |_| TokenKind::BitOrAssign)]
    #[token("^", |_| TokenKind::BitXor)]
    #[token("^=", |_| TokenKind::BitXorAssign)]
    #[token("+", |_| TokenKind::Add)]
    #[token("+=", |_| TokenKind::AddAssign)]
    #[token("++", |_| TokenKind::Inc)]
    #[token("-", |_| TokenKind::Sub)]
    #[token("-=", |_| TokenKind::SubAssign)]
    #[token("--", |_| TokenKind::Dec)]
    #[token("%", |_| TokenKind::Mod)]
    #[token("%=", |_| TokenKind::ModAssign)]
    #[token("%[", |_| TokenKind::DictOpen)]
    #[token("/", |_| TokenKind::Div)]
    #[token("/=", |_| TokenKind::DivAssign)]
    #[token("\\", |_| TokenKind::IntDiv)]
    #[token("\\=", |_| TokenKind::IntDivAssign)]
    #[token("*", |_| TokenKind::Mul)]
    #[token("*=", |_| TokenKind::MulAssign)]
    #[token(">", |_| TokenKind::Gt)]
    #[token(">>", |_| TokenKind::Shr)]
    #[token(">>=", |_| TokenKind::ShrAssign)]
    #[token(">=", |_| TokenKind::Ge)]
    #[token("<", |_| TokenKind::Lt)]
    #[token("<<", |_| TokenKind::Shl)]
    #[token("<<=", |_| TokenKind::ShlAssign)]
    #[token("<=", |_| TokenKind::Le)]
    #[token("?", |_| TokenKind::Question)]
    #[token(":", |_| TokenKind::Colon)]
    #[token("!", |_| TokenKind::Not)]
    #[token("!=", |_| TokenKind::NotEq)]
    #[token("!==", |_| TokenKind::StrictNotEq)]
    #[token("~", |_| TokenKind::BitNot)]
    #[token("#", |_| TokenKind::Hash)]
    #[token("$", |_| TokenKind::Dollar)]
    #[token(";", |_| TokenKind::Semicolon)]
    #[token(".", |_| TokenKind::Dot)]
    #[token("(", |_| TokenKind::LParen)]
    #[token(")", |_| TokenKind::RParen)]
    #[token("[", |_| TokenKind::LBracket)]
    #[token("]", |_| TokenKind::RBracket)]
    #[token("{", |_| TokenKind::LBrace)]
    #[token("}", |_| TokenKind::RBrace)]
    Punct(TokenKind),
}

fn keyword(name: &str) -> Option<TokenKind> {
    let kind = match name {
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "new" => TokenKind::New,
        "instanceof" => TokenKind::Instanceof,
        "typeof" => TokenKind::Typeof,
        "delete" => TokenKind::Delete,
        "int" => TokenKind::Int,
        "real" => TokenKind::Real,
        "string" => TokenKind::String,
        "switch" => TokenKind::Switch,
        "case" => TokenKind::Case,
        "default" => TokenKind::Default,
        "function" => TokenKind::Function,
        "return" => TokenKind::Return,
        "class" => TokenKind::Class,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "this" => TokenKind::This,
        "super" => TokenKind::Super,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "global" => TokenKind::Global,
        "for" => TokenKind::For,
        "while" => TokenKind::While,
        "do" => TokenKind::Do,
        "var" => TokenKind::Var,
        _ => return None,
    };
    Some(kind)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
}

/// Pull-based tokenizer with a single slot of pushback.
pub struct Lexer<'src> {
    source: &'src str,
    raw: logos::Lexer<'src, Raw<'src>>,
    map: SourceMap,
    pushed: Option<Token>,
    after_dot: bool,
    finished: bool,
}

impl<'src> Lexer<'src> {
    /// `source` must already be newline-normalized.
    pub fn new(source: &'src str) -> Self {
        Lexer {
            source,
            raw: Raw::lexer(source),
            map: SourceMap::new(source),
            pushed: None,
            after_dot: false,
            finished: false,
        }
    }

    pub fn push_back(&mut self, token: Token) {
        debug_assert!(self.pushed.is_none(), "lexer pushback holds one token");
        self.pushed = Some(token);
    }

    pub fn next_token(&mut self) -> Result<Token> {
        if let Some(token) = self.pushed.take() {
            return Ok(token);
        }
        let next = if self.finished { None } else { self.raw.next() };
        let Some(result) = next else {
            self.finished = true;
            let (line, col) = self.map.position(self.source.len());
            return Ok(Token { kind: TokenKind::End, line, col });
        };

        let span = self.raw.span();
        let (line, col) = self.map.position(span.start);
        let raw = result.map_err(|()| {
            ScriptError::lexical(format!("invalid character `{}`", self.raw.slice()), line, col)
        })?;

        let kind = match raw {
            Raw::OpenComment => {
                self.finished = true;
                TokenKind::End
            }
            Raw::Number(text) => match text.parse::<f64>() {
                Ok(n) => TokenKind::Number(n),
                Err(_) => {
                    return Err(ScriptError::lexical(format!("malformed number `{text}`"), line, col));
                }
            },
            Raw::Str(text) => TokenKind::Str(self.unescape(text, span.start)?),
            Raw::OpenStr => return Err(ScriptError::lexical("string not ended", line, col)),
            Raw::Ident(name) if self.after_dot => TokenKind::Ident(name.to_string()),
            Raw::Ident(name) => keyword(name).unwrap_or_else(|| TokenKind::Ident(name.to_string())),
            Raw::Punct(kind) => kind,
        };
        self.after_dot = kind == TokenKind::Dot;
        Ok(Token { kind, line, col })
    }

    /// Decodes a quoted literal; `start` is the byte offset of its opening quote.
    fn unescape(&self, quoted: &str, start: usize) -> Result<String> {
        let body = &quoted[1..quoted.len() - 1];
        let mut out = String::with_capacity(body.len());
        let mut chars = body.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            let here = || self.map.position(start + 1 + i);
            let Some((_, escape)) = chars.next() else {
                let (line, col) = here();
                return Err(ScriptError::lexical("string not ended", line, col));
            };
            let decoded = match escape {
                '\\' => '\\',
                '\'' => '\'',
                '"' => '"',
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                'a' => '\x07',
                'b' => '\x08',
                'f' => '\x0C',
                'v' => '\x0B',
                'x' => {
                    let mut code = 0u32;
                    let mut digits = 0;
                    while digits < 4 {
                        match chars.peek().and_then(|&(_, h)| h.to_digit(16)) {
                            Some(d) => {
                                code = code * 16 + d;
                                digits += 1;
                                chars.next();
                            }
                            None => break,
                        }
                    }
                    match char::from_u32(code) {
                        Some(ch) if digits > 0 => ch,
                        _ => {
                            let (line, col) = here();
                            return Err(ScriptError::lexical("illegal \\x sequence", line, col));
                        }
                    }
                }
                other => {
                    let (line, col) = here();
                    return Err(ScriptError::lexical(
                        format!("illegal escape sequence `\\{other}`"),
                        line,
                        col,
                    ));
                }
            };
            out.push(decoded);
        }
        Ok(out)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TokenKind::Number(n) => return write!(f, "number {n}"),
            TokenKind::Str(s) => return write!(f, "string \"{s}\""),
            TokenKind::Ident(name) => return write!(f, "`{name}`"),
            TokenKind::End => return f.write_str("end of input"),
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::New => "new",
            TokenKind::Instanceof => "instanceof",
            TokenKind::Typeof => "typeof",
            TokenKind::Delete => "delete",
            TokenKind::Int => "int",
            TokenKind::Real => "real",
            TokenKind::String => "string",
            TokenKind::Switch => "switch",
            TokenKind::Case => "case",
            TokenKind::Default => "default",
            TokenKind::Function => "function",
            TokenKind::Return => "return",
            TokenKind::Class => "class",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::This => "this",
            TokenKind::Super => "super",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Global => "global",
            TokenKind::For => "for",
            TokenKind::While => "while",
            TokenKind::Do => "do",
            TokenKind::Var => "var",
            TokenKind::Comma => ",",
            TokenKind::Assign => "=",
            TokenKind::Eq => "==",
            TokenKind::StrictEq => "===",
            TokenKind::Arrow => "=>",
            TokenKind::BitAnd => "&",
            TokenKind::And => "&&",
            TokenKind::AndAssign => "&&=",
            TokenKind::BitAndAssign => "&=",
            TokenKind::BitOr => "|",
            TokenKind::Or => "||",
            TokenKind::OrAssign => "||=",
            TokenKind::BitOrAssign => "|=",
            TokenKind::BitXor => "^",
            TokenKind::BitXorAssign => "^=",
            TokenKind::Add => "+",
            TokenKind::AddAssign => "+=",
            TokenKind::Inc => "++",
            TokenKind::Sub => "-",
            TokenKind::SubAssign => "-=",
            TokenKind::Dec => "--",
            TokenKind::Mod => "%",
            TokenKind::ModAssign => "%=",
            TokenKind::DictOpen => "%[",
            TokenKind::Div => "/",
            TokenKind::DivAssign => "/=",
            TokenKind::IntDiv => "\\",
            TokenKind::IntDivAssign => "\\=",
            TokenKind::Mul => "*",
            TokenKind::MulAssign => "*=",
            TokenKind::Gt => ">",
            TokenKind::Shr => ">>",
            TokenKind::ShrAssign => ">>=",
            TokenKind::Ge => ">=",
            TokenKind::Lt => "<",
            TokenKind::Shl => "<<",
            TokenKind::ShlAssign => "<<=",
            TokenKind::Le => "<=",
            TokenKind::Question => "?",
            TokenKind::Colon => ":",
            TokenKind::Not => "!",
            TokenKind::NotEq => "!=",
            TokenKind::StrictNotEq => "!==",
            TokenKind::BitNot => "~",
            TokenKind::Hash => "#",
            TokenKind::Dollar => "$",
            TokenKind::Semicolon => ";",
            TokenKind::Dot => ".",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
        };
        write!(f, "`{text}`")
    }
}

/// Lexes a whole (normalized) source into kinds, stopping before `End`.
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        if token.kind == TokenKind::End {
            return Ok(tokens);
        }
        tokens.push(token);
    }
}
