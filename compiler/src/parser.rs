// Parser for emitted C++ render procedures.
//
// Parses a token stream (from the lexer) back into a `LirProgram`, accepting
// exactly the C++ subset `codegen` prints: module-scope state statics, one
// `extern "C"` render function with the fixed ABI, temporary declarations,
// counted loops over `i`, and `if`/`else` on the audio predicate. Uses
// chumsky combinators.
//
// Preconditions: input is artifact text (from `codegen::codegen` or a file
//   claiming to be one).
// Postconditions: on success the program has the same buffers, kernels and
//   expression trees the text spells out; state slots are keyed by symbol.
// Failure modes: syntax errors produce `Rich` diagnostics; an artifact that
//   never writes `out` is rejected.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::error::{PgcError, PgcResult};
use crate::lexer::Token;
use crate::lir::*;

/// Result of parsing: program plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<LirProgram>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse artifact text. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = artifact_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    // Merge lex errors + parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program,
        errors: all_errors,
    }
}

/// Parse artifact text, folding any error into `PgcError::Artifact`.
pub fn parse_artifact(source: &str) -> PgcResult<LirProgram> {
    let result = parse(source);
    match result.program {
        Some(program) if result.errors.is_empty() => Ok(program),
        _ => {
            let mut messages: Vec<String> = result
                .errors
                .iter()
                .map(|e| format!("{}..{}: {}", e.span().start(), e.span().end(), e))
                .collect();
            if messages.is_empty() {
                messages.push("parse failed with no output".to_string());
            }
            Err(PgcError::Artifact(messages))
        }
    }
}

// ── Intermediate form ──

/// The artifact as spelled, before the frame width is recovered.
struct Artifact {
    statics: Vec<(String, usize)>,
    function: String,
    temps: Vec<LirTemp>,
    body: Vec<LirStmt>,
}

impl Artifact {
    fn into_program(self) -> Result<LirProgram, String> {
        let frame_width = output_width(&self.body)
            .ok_or_else(|| "artifact has no loop writing `out`".to_string())?;
        Ok(LirProgram {
            function: self.function,
            frame_width,
            slots: self
                .statics
                .into_iter()
                .map(|(symbol, len)| LirSlot {
                    owner: symbol.clone(),
                    symbol,
                    len,
                })
                .collect(),
            temps: self.temps,
            body: self.body,
        })
    }
}

/// Trip count of the first loop that stores to `out`.
fn output_width(stmts: &[LirStmt]) -> Option<usize> {
    stmts.iter().find_map(|s| match s {
        LirStmt::Note(_) => None,
        LirStmt::Loop { count, body } => body
            .iter()
            .any(|i| matches!(i, LirInstr::Store { place, .. } if place.target == Target::Out))
            .then_some(*count),
        LirStmt::If {
            then_body,
            else_body,
            ..
        } => output_width(then_body).or_else(|| output_width(else_body)),
    })
}

// ── Main parser builder ──
//
// All grammar rules are built inside `artifact_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn artifact_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, LirProgram, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifiers ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        source[span.start()..span.end()].to_string()
    });

    // A specific identifier spelling (`i`, `audio`, `clamp_val`, ...).
    let word = |w: &'static str| {
        ident.clone().try_map(move |name: String, span| {
            if name == w {
                Ok(())
            } else {
                Err(Rich::custom(span, format!("expected `{}`, found `{}`", w, name)))
            }
        })
    };

    // ── Literals ──

    let float_lit = select! { Token::FloatLit(v) => v };
    let int_lit = select! { Token::IntLit(n) => n };
    let length = int_lit
        .clone()
        .delimited_by(just(Token::LBracket), just(Token::RBracket));
    let zero_init = just(Token::Assign)
        .then(just(Token::LBrace))
        .then(just(Token::RBrace))
        .then(just(Token::Semi))
        .ignored();

    // ── Index: i | N - i | N + i ──

    let index = choice((
        int_lit
            .clone()
            .then_ignore(just(Token::Minus))
            .then_ignore(word("i"))
            .map(|last| LirIndex::Reverse { last }),
        int_lit
            .clone()
            .then_ignore(just(Token::Plus))
            .then_ignore(word("i"))
            .map(LirIndex::Offset),
        word("i").to(LirIndex::I),
    ))
    .delimited_by(just(Token::LBracket), just(Token::RBracket));

    // ── Place: sym[index] or sym[index].c ──

    let channel = just(Token::Dot)
        .ignore_then(ident.clone())
        .try_map(|name: String, span| {
            Channel::from_name(&name)
                .ok_or_else(|| Rich::custom(span, format!("unknown channel `.{}`", name)))
        });

    let place = ident
        .clone()
        .then(index.clone())
        .then(channel.or_not())
        .map(|((symbol, index), channel)| LirPlace {
            target: if symbol == "out" {
                Target::Out
            } else {
                Target::Buffer(symbol)
            },
            index,
            channel,
        });

    // ── Expressions ──

    let expr = recursive(|expr| {
        let index_f = just(Token::LParen)
            .then(just(Token::Float))
            .then(just(Token::RParen))
            .then(word("i"))
            .to(LirExpr::IndexF);

        let unit_bounds = just(Token::Comma)
            .then(select! { Token::FloatLit(v) if v == 0.0 => () })
            .then(just(Token::Comma))
            .then(select! { Token::FloatLit(v) if v == 1.0 => () });
        let clamp = word("clamp_val")
            .ignore_then(
                expr.clone()
                    .then_ignore(unit_bounds)
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map(LirExpr::clamp01);

        let floor = word("std")
            .then(just(Token::ColonColon))
            .then(word("floor"))
            .ignore_then(
                expr.clone()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map(LirExpr::floor);

        let param = word("params")
            .then(just(Token::Dot))
            .ignore_then(ident.clone())
            .try_map(|name: String, span| {
                ParamField::from_name(&name)
                    .map(LirExpr::Param)
                    .ok_or_else(|| Rich::custom(span, format!("unknown parameter `{}`", name)))
            });

        let spectrum = word("audio")
            .then(just(Token::Arrow))
            .then(word("spectrum"))
            .ignore_then(index.clone())
            .map(LirExpr::Spectrum);

        let energy = word("audio")
            .then(just(Token::Arrow))
            .then(word("energy"))
            .to(LirExpr::Energy);

        let paren = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let atom = choice((
            float_lit.clone().map(LirExpr::Const),
            index_f,
            paren,
            clamp,
            floor,
            param,
            spectrum,
            energy,
            place.clone().map(LirExpr::Load),
            ident.clone().map(LirExpr::Local),
        ));

        let product_op = choice((
            just(Token::Star).to(BinOp::Mul),
            just(Token::Slash).to(BinOp::Div),
        ));
        let product = atom.clone().foldl(
            product_op.then(atom).repeated(),
            |lhs, (op, rhs)| LirExpr::binary(op, lhs, rhs),
        );

        let sum_op = choice((
            just(Token::Plus).to(BinOp::Add),
            just(Token::Minus).to(BinOp::Sub),
        ));
        product.clone().foldl(
            sum_op.then(product).repeated(),
            |lhs, (op, rhs)| LirExpr::binary(op, lhs, rhs),
        )
    });

    // ── Instructions ──

    let let_instr = just(Token::Const)
        .then(just(Token::Float))
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Assign))
        .then(expr.clone())
        .then_ignore(just(Token::Semi))
        .map(|(name, value)| LirInstr::Let { name, value });

    let quantized = word("uint8_t")
        .delimited_by(just(Token::LParen), just(Token::RParen))
        .ignore_then(
            expr.clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|value| (true, value));

    let store_instr = place
        .clone()
        .then_ignore(just(Token::Assign))
        .then(quantized.or(expr.clone().map(|value| (false, value))))
        .then_ignore(just(Token::Semi))
        .try_map(|(place, (cast, value)), span| {
            let to_out = place.target == Target::Out;
            match (to_out, cast) {
                (true, true) | (false, false) => Ok(LirInstr::Store { place, value }),
                (true, false) => Err(Rich::custom(span, "store to `out` must cast to uint8_t")),
                (false, true) => Err(Rich::custom(span, "only stores to `out` cast to uint8_t")),
            }
        });

    let instr = let_instr.or(store_instr);

    // ── Statements ──

    let loop_header = just(Token::Int)
        .then(word("i"))
        .then(just(Token::Assign))
        .then(select! { Token::IntLit(0) => () })
        .then(just(Token::Semi))
        .then(word("i"))
        .then(just(Token::Lt))
        .ignore_then(int_lit)
        .then_ignore(just(Token::Semi))
        .then_ignore(just(Token::PlusPlus))
        .then_ignore(word("i"))
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let for_loop = just(Token::For)
        .ignore_then(loop_header)
        .then(
            instr
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map(|(count, body)| LirStmt::Loop { count, body });

    let energy_gate = just(Token::AndAnd)
        .then(word("audio"))
        .then(just(Token::Arrow))
        .then(word("energy"))
        .then(just(Token::Gt))
        .ignore_then(float_lit);

    let pred = word("audio")
        .then(just(Token::NotEq))
        .then(just(Token::Nullptr))
        .ignore_then(energy_gate.or_not())
        .map(|gate| match gate {
            Some(threshold) => LirPred::EnergyAbove(threshold),
            None => LirPred::AudioPresent,
        })
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let stmts = recursive(|stmts| {
        let block = stmts
            .clone()
            .delimited_by(just(Token::LBrace), just(Token::RBrace));
        let if_stmt = just(Token::If)
            .ignore_then(pred)
            .then(block.clone())
            .then_ignore(just(Token::Else))
            .then(block)
            .map(|((pred, then_body), else_body)| LirStmt::If {
                pred,
                then_body,
                else_body,
            });

        for_loop.or(if_stmt).repeated().collect::<Vec<_>>()
    });

    // ── Declarations ──

    let static_decl = just(Token::Static)
        .then(just(Token::Float))
        .ignore_then(ident.clone())
        .then(length.clone())
        .then_ignore(zero_init.clone());

    let temp_decl = choice((
        just(Token::Float).to(ElemType::Float),
        word("CRGBF").to(ElemType::Rgb),
    ))
    .then(ident.clone())
    .then(length)
    .then_ignore(zero_init)
    .map(|((elem, symbol), len)| LirTemp { symbol, elem, len });

    // ── Signature: extern "C" void [IRAM_ATTR] name(<fixed ABI>) ──

    let abi_params = just(Token::Float)
        .then(word("time"))
        .then(just(Token::Comma))
        .then(just(Token::Const))
        .then(word("AudioSnapshot"))
        .then(just(Token::Star))
        .then(word("audio"))
        .then(just(Token::Comma))
        .then(just(Token::Const))
        .then(word("PatternParameters"))
        .then(just(Token::Amp))
        .then(word("params"))
        .then(just(Token::Comma))
        .then(word("CRGB8"))
        .then(just(Token::Star))
        .then(word("out"))
        .ignored()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let signature = just(Token::Extern)
        .ignore_then(select! { Token::StrLit(s) if s == "C" => () })
        .ignore_then(just(Token::Void))
        .ignore_then(ident.clone().repeated().at_least(1).collect::<Vec<String>>())
        .then_ignore(abi_params)
        .try_map(|mut names: Vec<String>, span| {
            let function = names.pop().unwrap_or_default();
            match names.iter().find(|attr| attr.as_str() != "IRAM_ATTR") {
                Some(attr) => Err(Rich::custom(span, format!("unknown attribute `{}`", attr))),
                None => Ok(function),
            }
        });

    // ── Artifact ──

    static_decl
        .repeated()
        .collect::<Vec<_>>()
        .then(signature)
        .then_ignore(just(Token::LBrace))
        .then(temp_decl.repeated().collect::<Vec<_>>())
        .then(stmts)
        .then_ignore(just(Token::RBrace))
        .then_ignore(end())
        .try_map(|(((statics, function), temps), body), span| {
            Artifact {
                statics,
                function,
                temps,
                body,
            }
            .into_program()
            .map_err(|msg| Rich::custom(span, msg))
        })
}

// ── Tests ──
