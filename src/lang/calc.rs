//! `calc`, the built-in scripting language.
//!
//! A small expression language: numbers, strings, `let` bindings,
//! `+ - * / % ^`, parentheses, `#` comments and a handful of builtins.
//! Statements are separated by newlines or `;`. Method calls on a bound
//! session name (`sh.exit(3)`) drive the shell.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{Interpreter, InterpreterFactory, ScriptError, ShellHost};

/// Deepest expression nesting a single statement may use
const MAX_DEPTH: usize = 256;

/// Factory for [`Calc`] interpreters
pub struct CalcFactory;

impl InterpreterFactory for CalcFactory {
    fn language_name(&self) -> &str {
        "calc"
    }

    fn language_version(&self) -> &str {
        "1.0"
    }

    fn engine_name(&self) -> &str {
        "cuf-calc"
    }

    fn extensions(&self) -> &[&'static str] {
        &["calc"]
    }

    fn mime_types(&self) -> &[&'static str] {
        &["text/x-calc", "application/x-calc"]
    }

    fn aliases(&self) -> &[&'static str] {
        &["calculator"]
    }

    fn method_call_syntax(&self, object: &str, method: &str, args: &[&str]) -> String {
        format!("{}.{}({})", object, method, args.join(", "))
    }

    fn create(&self) -> Box<dyn Interpreter> {
        Box::new(Calc::default())
    }
}

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Str(String),
    Unit,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Num(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Unit => Ok(()),
        }
    }
}

/// The calc interpreter
#[derive(Default)]
pub struct Calc {
    vars: HashMap<String, Value>,
    hosts: HashMap<String, Arc<dyn ShellHost>>,
    /// Most recently bound host; target of `print`
    default_host: Option<Arc<dyn ShellHost>>,
}

impl Interpreter for Calc {
    fn eval(&mut self, source: &str, source_name: Option<&str>) -> anyhow::Result<Option<String>> {
        let tokens = lex(source, source_name)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            depth: 0,
            calc: self,
            source_name,
        };
        let value = parser.program()?;
        Ok(match value {
            Value::Unit => None,
            other => Some(other.to_string()),
        })
    }

    fn bind(&mut self, name: &str, host: Arc<dyn ShellHost>) {
        self.default_host = Some(host.clone());
        self.hosts.insert(name.to_string(), host);
    }

    fn invoke(&mut self, method: &str, args: &[String]) -> anyhow::Result<Option<String>> {
        let args: Vec<Value> = args
            .iter()
            .map(|a| match a.parse::<f64>() {
                Ok(n) => Value::Num(n),
                Err(_) => Value::Str(a.clone()),
            })
            .collect();
        let value = self
            .call_function(method, args)
            .map_err(ScriptError::new)?;
        Ok(match value {
            Value::Unit => None,
            other => Some(other.to_string()),
        })
    }
}

impl Calc {
    fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<Value, String> {
        let nums = || -> Result<Vec<f64>, String> {
            args.iter()
                .map(|a| match a {
                    Value::Num(n) => Ok(*n),
                    other => Err(format!("{}() expects numbers, got '{}'", name, other)),
                })
                .collect()
        };
        match name {
            "sqrt" => one(name, nums()?).map(|n| Value::Num(n.sqrt())),
            "abs" => one(name, nums()?).map(|n| Value::Num(n.abs())),
            "min" => nums()?
                .into_iter()
                .reduce(f64::min)
                .map(Value::Num)
                .ok_or_else(|| "min() needs at least one argument".to_string()),
            "max" => nums()?
                .into_iter()
                .reduce(f64::max)
                .map(Value::Num)
                .ok_or_else(|| "max() needs at least one argument".to_string()),
            "print" => {
                let text = args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
                match &self.default_host {
                    Some(host) => {
                        host.out(&format!("{}\n", text)).map_err(|e| e.to_string())?;
                        Ok(Value::Unit)
                    }
                    None => Ok(Value::Str(text)),
                }
            }
            _ => Err(format!("unknown function '{}'", name)),
        }
    }
}

fn one(name: &str, nums: Vec<f64>) -> Result<f64, String> {
    match nums.as_slice() {
        [n] => Ok(*n),
        _ => Err(format!("{}() takes exactly one argument", name)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Sym(char),
    Sep,
}

#[derive(Debug)]
struct Lexed {
    token: Token,
    line: usize,
}

fn lex(source: &str, source_name: Option<&str>) -> Result<Vec<Lexed>, ScriptError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                tokens.push(Lexed { token: Token::Sep, line });
                line += 1;
                i += 1;
            }
            ';' => {
                tokens.push(Lexed { token: Token::Sep, line });
                i += 1;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            c if c.is_whitespace() => i += 1,
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ScriptError::at(format!("bad number '{}'", text), source_name, line))?;
                tokens.push(Lexed { token: Token::Num(n), line });
            }
            '"' | '\'' => {
                let quote = c;
                let start_line = line;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(ScriptError::at("unterminated string", source_name, start_line));
                    };
                    i += 1;
                    match ch {
                        ch if ch == quote => break,
                        '\\' => {
                            let escaped = chars.get(i).copied().unwrap_or('\\');
                            i += 1;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                        '\n' => {
                            line += 1;
                            text.push('\n');
                        }
                        other => text.push(other),
                    }
                }
                tokens.push(Lexed { token: Token::Str(text), line: start_line });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Lexed { token: Token::Ident(text), line });
            }
            '+' | '-' | '*' | '/' | '%' | '^' | '(' | ')' | ',' | '.' | '=' => {
                tokens.push(Lexed { token: Token::Sym(c), line });
                i += 1;
            }
            other => {
                return Err(ScriptError::at(
                    format!("unexpected character '{}'", other),
                    source_name,
                    line,
                ));
            }
        }
    }
    Ok(tokens)
}

/// Evaluates while parsing
struct Parser<'a> {
    tokens: &'a [Lexed],
    pos: usize,
    /// Nested `unary` calls; bounded so deep input cannot exhaust the stack
    depth: usize,
    calc: &'a mut Calc,
    source_name: Option<&'a str>,
}

type Eval = anyhow::Result<Value>;

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> anyhow::Error {
        ScriptError::at(message, self.source_name, self.line()).into()
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: char) -> anyhow::Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", sym)))
        }
    }

    fn program(&mut self) -> Eval {
        let mut last = Value::Unit;
        loop {
            while self.peek() == Some(&Token::Sep) {
                self.pos += 1;
            }
            if self.peek().is_none() {
                return Ok(last);
            }
            last = self.statement()?;
            match self.peek() {
                None | Some(Token::Sep) => {}
                Some(other) => {
                    let other = format!("{:?}", other);
                    return Err(self.error(format!("unexpected {}", other)));
                }
            }
        }
    }

    fn statement(&mut self) -> Eval {
        if self.peek() == Some(&Token::Ident("let".to_string())) {
            self.pos += 1;
            let name = match self.peek() {
                Some(Token::Ident(name)) => name.clone(),
                _ => return Err(self.error("expected a name after 'let'")),
            };
            self.pos += 1;
            self.expect_sym('=')?;
            let value = self.expr()?;
            self.calc.vars.insert(name, value);
            return Ok(Value::Unit);
        }
        self.expr()
    }

    fn expr(&mut self) -> Eval {
        let mut left = self.term()?;
        loop {
            if self.eat_sym('+') {
                let right = self.term()?;
                left = match (left, right) {
                    (Value::Num(a), Value::Num(b)) => Value::Num(a + b),
                    (Value::Unit, _) | (_, Value::Unit) => {
                        return Err(self.error("cannot add nothing"));
                    }
                    (a, b) => Value::Str(format!("{}{}", a, b)),
                };
            } else if self.eat_sym('-') {
                let right = self.term()?;
                left = self.arith(left, right, '-')?;
            } else {
                return Ok(left);
            }
        }
    }

    fn term(&mut self) -> Eval {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Sym(op @ ('*' | '/' | '%'))) => *op,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = self.arith(left, right, op)?;
        }
    }

    fn unary(&mut self) -> Eval {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(format!("expression nested deeper than {} levels", MAX_DEPTH)));
        }
        self.depth += 1;
        let result = if self.eat_sym('-') {
            self.unary()
                .and_then(|value| self.arith(Value::Num(0.0), value, '-'))
        } else {
            self.power()
        };
        self.depth -= 1;
        result
    }

    fn power(&mut self) -> Eval {
        let base = self.primary()?;
        if self.eat_sym('^') {
            let exponent = self.unary()?;
            return self.arith(base, exponent, '^');
        }
        Ok(base)
    }

    fn arith(&self, left: Value, right: Value, op: char) -> Eval {
        let (a, b) = match (&left, &right) {
            (Value::Num(a), Value::Num(b)) => (*a, *b),
            _ => return Err(self.error(format!("'{}' needs numbers, got '{}' and '{}'", op, left, right))),
        };
        Ok(Value::Num(match op {
            '-' => a - b,
            '*' => a * b,
            '/' if b == 0.0 => return Err(self.error("division by zero")),
            '/' => a / b,
            '%' if b == 0.0 => return Err(self.error("division by zero")),
            '%' => a % b,
            _ => a.powf(b),
        }))
    }

    fn primary(&mut self) -> Eval {
        let token = match self.tokens.get(self.pos) {
            Some(lexed) => lexed.token.clone(),
            None => return Err(self.error("unexpected end of input")),
        };
        self.pos += 1;
        match token {
            Token::Num(n) => Ok(Value::Num(n)),
            Token::Str(s) => Ok(Value::Str(s)),
            Token::Sym('(') => {
                let value = self.expr()?;
                self.expect_sym(')')?;
                Ok(value)
            }
            Token::Ident(name) => {
                if self.eat_sym('(') {
                    let args = self.args()?;
                    let line = self.line();
                    return self
                        .calc
                        .call_function(&name, args)
                        .map_err(|msg| ScriptError::at(msg, self.source_name, line).into());
                }
                if self.eat_sym('.') {
                    let method = match self.peek() {
                        Some(Token::Ident(m)) => m.clone(),
                        _ => return Err(self.error("expected a method name after '.'")),
                    };
                    self.pos += 1;
                    self.expect_sym('(')?;
                    let args = self.args()?;
                    return self.call_method(&name, &method, args);
                }
                match self.calc.vars.get(&name) {
                    Some(value) => Ok(value.clone()),
                    None => Err(self.error(format!("unknown name '{}'", name))),
                }
            }
            other => Err(self.error(format!("unexpected {:?}", other))),
        }
    }

    /// Arguments after an opening parenthesis, through the closing one
    fn args(&mut self) -> anyhow::Result<Vec<Value>> {
        let mut args = Vec::new();
        if self.eat_sym(')') {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat_sym(')') {
                return Ok(args);
            }
            self.expect_sym(',')?;
        }
    }

    fn call_method(&mut self, object: &str, method: &str, args: Vec<Value>) -> Eval {
        let host = match self.calc.hosts.get(object) {
            Some(host) => host.clone(),
            None => return Err(self.error(format!("unknown object '{}'", object))),
        };

        let int_arg = |i: usize| -> Option<i64> {
            match args.get(i) {
                Some(Value::Num(n)) if n.fract() == 0.0 && n.abs() < 1e18 => Some(*n as i64),
                _ => None,
            }
        };
        let code_arg = |i: usize| -> Option<i32> { int_arg(i).and_then(|n| i32::try_from(n).ok()) };
        let index_arg = |i: usize| -> Option<usize> { int_arg(i).and_then(|n| usize::try_from(n).ok()) };
        let str_arg = |i: usize| -> Option<String> {
            match args.get(i) {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            }
        };
        let usage = |signature: &str| -> anyhow::Error {
            self.error(format!("usage: {}.{}", object, signature))
        };

        match method {
            "name" => Ok(Value::Str(host.name())),
            "exit" => {
                let code = if args.is_empty() {
                    0
                } else {
                    code_arg(0).ok_or_else(|| usage("exit(code)"))?
                };
                host.exit(code)?;
                Ok(Value::Unit)
            }
            "jump" => {
                let index = index_arg(0).ok_or_else(|| usage("jump(index)"))?;
                host.jump(index)?;
                Ok(Value::Unit)
            }
            "fork" => {
                let script = str_arg(0).ok_or_else(|| usage("fork(\"script\")"))?;
                Ok(match host.fork(&script)? {
                    Some(index) => Value::Num(index as f64),
                    None => Value::Unit,
                })
            }
            "link" => {
                let path = str_arg(0).ok_or_else(|| usage("link(\"archive\")"))?;
                Ok(Value::Str(host.link(&path)?.to_string()))
            }
            "kill" => {
                let code = if args.is_empty() {
                    None
                } else {
                    Some(code_arg(0).ok_or_else(|| usage("kill(code)"))?)
                };
                host.kill(code)?;
                Ok(Value::Unit)
            }
            "list" => Ok(Value::Str(host.list()?)),
            "wait" => {
                let index = index_arg(0).ok_or_else(|| usage("wait(index)"))?;
                Ok(Value::Num(host.wait(index)? as f64))
            }
            "compile" => {
                let (Some(source), Some(output)) = (str_arg(0), str_arg(1)) else {
                    return Err(usage("compile(\"source\", \"output\")"));
                };
                Ok(Value::Num(host.compile(&source, &output)? as f64))
            }
            "cancel" => {
                let index = index_arg(0).ok_or_else(|| usage("cancel(job)"))?;
                host.cancel(index)?;
                Ok(Value::Unit)
            }
            "join" => {
                let index = index_arg(0).ok_or_else(|| usage("join(job)"))?;
                Ok(Value::Num(host.join(index)? as f64))
            }
            "jobs" => Ok(Value::Str(host.jobs()?)),
            other => Err(self.error(format!("'{}' has no method '{}'", object, other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    fn eval(source: &str) -> anyhow::Result<Option<String>> {
        Calc::default().eval(source, None)
    }

    #[derive(Default)]
    struct FakeHost {
        calls: Mutex<Vec<String>>,
    }

    impl ShellHost for FakeHost {
        fn name(&self) -> String {
            "sh".to_string()
        }
        fn out(&self, text: &str) -> anyhow::Result<()> {
            self.calls.lock().push(format!("out {}", text.trim_end()));
            Ok(())
        }
        fn exit(&self, code: i32) -> anyhow::Result<()> {
            self.calls.lock().push(format!("exit {}", code));
            Ok(())
        }
        fn jump(&self, index: usize) -> anyhow::Result<()> {
            anyhow::bail!("index {} out of range", index)
        }
        fn fork(&self, script: &str) -> anyhow::Result<Option<usize>> {
            self.calls.lock().push(format!("fork {}", script));
            Ok(Some(1))
        }
        fn link(&self, _path: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn kill(&self, code: Option<i32>) -> anyhow::Result<()> {
            self.calls.lock().push(format!("kill {:?}", code));
            Ok(())
        }
        fn list(&self) -> anyhow::Result<String> {
            Ok("[0] * sh".to_string())
        }
        fn wait(&self, _index: usize) -> anyhow::Result<i32> {
            Ok(7)
        }
        fn compile(&self, source: &str, output: &str) -> anyhow::Result<usize> {
            self.calls.lock().push(format!("compile {} {}", source, output));
            Ok(0)
        }
        fn cancel(&self, index: usize) -> anyhow::Result<()> {
            self.calls.lock().push(format!("cancel {}", index));
            Ok(())
        }
        fn join(&self, _index: usize) -> anyhow::Result<i32> {
            Ok(0x6F)
        }
        fn jobs(&self) -> anyhow::Result<String> {
            Ok("[0] raw in running".to_string())
        }
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1+1").unwrap().as_deref(), Some("2"));
        assert_eq!(eval("2 * (3 + 4) - 1").unwrap().as_deref(), Some("13"));
        assert_eq!(eval("-2 ^ 2").unwrap().as_deref(), Some("-4"));
        assert_eq!(eval("7 / 2").unwrap().as_deref(), Some("3.5"));
        assert_eq!(eval("7 % 4").unwrap().as_deref(), Some("3"));
        assert_eq!(eval("max(1, 9, 4) + sqrt(16)").unwrap().as_deref(), Some("13"));
    }

    #[test]
    fn test_bindings_and_statements() {
        let mut calc = Calc::default();
        assert_eq!(calc.eval("let x = 4; let y = x * 2", None).unwrap(), None);
        assert_eq!(calc.eval("x + y", None).unwrap().as_deref(), Some("12"));
        assert_eq!(
            calc.eval("# comment\n'a' + 1\n", None).unwrap().as_deref(),
            Some("a1")
        );
    }

    #[test]
    fn test_errors_carry_location() {
        let err = Calc::default()
            .eval("1\n2 / 0", Some("bad.calc"))
            .unwrap_err();
        let script = err.downcast_ref::<ScriptError>().unwrap();
        assert_eq!(script.message, "division by zero");
        assert_eq!(script.location().as_deref(), Some("bad.calc:2"));

        assert!(eval("nope").is_err());
        assert!(eval("1 +").is_err());
        assert!(eval("\"open").is_err());
        assert!(eval("1 $ 2").is_err());
    }

    #[test]
    fn test_method_calls_reach_host() {
        let host = Arc::new(FakeHost::default());
        let mut calc = Calc::default();
        calc.bind("sh", host.clone());

        assert_eq!(calc.eval("sh.fork(\"a.calc\")", None).unwrap().as_deref(), Some("1"));
        assert_eq!(calc.eval("sh.wait(1)", None).unwrap().as_deref(), Some("7"));
        calc.eval("print(1, 'two'); sh.compile('in', 'out'); sh.kill(); sh.exit(3)", None)
            .unwrap();
        assert_eq!(
            *host.calls.lock(),
            vec!["fork a.calc", "out 1 two", "compile in out", "kill None", "exit 3"]
        );

        let err = calc.eval("sh.jump(4)", None).unwrap_err();
        assert_eq!(err.to_string(), "index 4 out of range");
        assert!(calc.eval("sh.jump('x')", None).is_err());
        assert!(calc.eval("other.exit()", None).is_err());
    }

    #[test]
    fn test_compile_job_methods() {
        let host = Arc::new(FakeHost::default());
        let mut calc = Calc::default();
        calc.bind("sh", host.clone());

        assert_eq!(calc.eval("sh.compile('in', 'out')", None).unwrap().as_deref(), Some("0"));
        calc.eval("sh.cancel(0)", None).unwrap();
        assert_eq!(calc.eval("sh.join(0)", None).unwrap().as_deref(), Some("111"));
        assert_eq!(calc.eval("sh.jobs()", None).unwrap().as_deref(), Some("[0] raw in running"));
        assert_eq!(*host.calls.lock(), vec!["compile in out", "cancel 0"]);
        assert!(calc.eval("sh.cancel(-1)", None).is_err());
    }

    #[test]
    fn test_exit_code_must_fit() {
        let host = Arc::new(FakeHost::default());
        let mut calc = Calc::default();
        calc.bind("sh", host.clone());

        let err = calc.eval("sh.exit(4294967296)", None).unwrap_err();
        assert!(err.to_string().contains("usage: sh.exit(code)"));
        assert!(calc.eval("sh.kill(2147483648)", None).is_err());
        assert!(calc.eval("sh.exit(1e300)", None).is_err());
        assert!(host.calls.lock().is_empty());

        calc.eval("sh.exit(-1)", None).unwrap();
        assert_eq!(*host.calls.lock(), vec!["exit -1"]);
    }

    #[test]
    fn test_deep_nesting_is_an_error() {
        let deep_minus = format!("{}1", "-".repeat(200_000));
        let deep_parens = format!("{}1{}", "(".repeat(5_000), ")".repeat(5_000));
        // A session thread's stack, not the test harness's
        let errors = thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                let mut calc = Calc::default();
                [deep_minus, deep_parens].map(|src| calc.eval(&src, None).unwrap_err().to_string())
            })
            .unwrap()
            .join()
            .unwrap();
        for err in errors {
            assert_eq!(err, "expression nested deeper than 256 levels");
        }

        let fine = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(eval(&fine).unwrap().as_deref(), Some("1"));
        assert_eq!(eval("--1").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_invoke() {
        let mut calc = Calc::default();
        assert_eq!(
            calc.invoke("min", &["3".to_string(), "2".to_string()]).unwrap().as_deref(),
            Some("2")
        );
        assert!(calc.invoke("nope", &[]).is_err());
    }

    #[test]
    fn test_factory_syntax() {
        assert_eq!(CalcFactory.method_call_syntax("sh", "exit", &["3"]), "sh.exit(3)");
    }
}
