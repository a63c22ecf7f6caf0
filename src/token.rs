extern crate variant_count;

use variant_count::VariantCount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, VariantCount)]
pub enum TokenType {
    LeftParen,    // 0
    RightParen,   // 1
    LeftBrace,    // 2
    RightBrace,   // 3
    LeftBracket,  // 4
    RightBracket, // 5
    Comma,        // 6
    Dot,          // 7
    Semicolon,    // 8
    Colon,        // 9
    Question,     // 10

    Minus,   // 11
    Plus,    // 12
    Star,    // 13
    Slash,   // 14
    Percent, // 15

    Bang,         // 16
    BangEqual,    // 17
    Equal,        // 18
    EqualEqual,   // 19
    Greater,      // 20
    GreaterEqual, // 21
    Less,         // 22
    LessEqual,    // 23

    Identifier, // 24
    String,     // 25
    Number,     // 26

    And,   // 27
    Or,    // 28
    Nil,   // 29
    True,  // 30
    False, // 31

    Var,    // 32
    Const,  // 33
    Class,  // 34
    Fun,    // 35
    If,     // 36
    Else,   // 37
    For,    // 38
    While,  // 39
    Return, // 40
    Print,  // 41

    Super,    // 42
    This,     // 43
    Break,    // 44
    Continue, // 45
    Switch,   // 46
    Case,     // 47
    Default,  // 48

    Error, // 49
    Eof,   // 50
}

/// What the scanner hands to the compiler: the kind, a borrow into the
/// caller-owned source buffer, and the 1-based source line.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub typ: TokenType,
    pub lexeme: &'src str,
    pub line: u32,
}

impl<'src> Token<'src> {
    pub fn empty() -> Self {
        Token {
            typ: TokenType::Eof,
            lexeme: "",
            line: 0,
        }
    }

    pub fn synthetic(lexeme: &'src str, line: u32) -> Self {
        Token {
            typ: TokenType::Identifier,
            lexeme,
            line,
        }
    }
}
