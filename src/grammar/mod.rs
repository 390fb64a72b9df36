/// Tokenizer shared by the action-call grammar and the evaluator expression
/// language. Both accept a small Python-flavoured surface syntax.
pub mod lexer;

pub use lexer::{tokenize, Cursor, LexError, Spanned, Token};
