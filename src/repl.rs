use std::{mem, sync::Arc};

use rustyline::{DefaultEditor, error::ReadlineError};

use crate::{
    bytecode::GlobalInfo,
    compiler,
    diagnostics::{NoodleError, Result},
    engine::Engine,
    heap::Heap,
    value::Primitive,
};

/// Line-at-a-time front end. Every line is compiled and run as its own
/// program; top-level variables and the objects they reach carry over to
/// later lines. Functions do not.
pub struct Repl {
    engine: Arc<Engine>,
    globals: Vec<GlobalInfo>,
    values: Vec<Primitive>,
    heap: Heap,
}

impl Repl {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            globals: Vec::new(),
            values: Vec::new(),
            heap: Heap::new(),
        }
    }

    /// Compiles and runs one line, returning the script's result. A line
    /// that fails to compile leaves the session untouched.
    pub fn eval_line(&mut self, line: &str) -> Result<Primitive> {
        let program = compiler::compile_with_globals(&self.engine, "<repl>", line, &self.globals)?;
        let program = Arc::new(program);
        let mut thread = self
            .engine
            .create_thread(&program, None, Vec::new())?
            .with_state(mem::take(&mut self.values), mem::take(&mut self.heap));
        let engine = &self.engine;
        let outcome = thread.run().and_then(|value| match value {
            Primitive::Object(_) => Ok(Primitive::string(engine.render(thread.heap(), &value)?)),
            other => Ok(other),
        });
        let (values, heap) = thread.into_state();
        self.values = values;
        self.heap = heap;
        self.globals = program.globals().to_vec();
        outcome
    }

    /// Names of the variables defined so far.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.globals.iter().map(|global| global.name.as_str())
    }

    pub fn run(&mut self) -> Result<()> {
        let mut editor = DefaultEditor::new().map_err(readline_error)?;
        loop {
            match editor.readline("noodle> ") {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed == ":quit" || trimmed == ":exit" {
                        break;
                    }
                    if trimmed.is_empty() {
                        continue;
                    }
                    editor.add_history_entry(trimmed).ok();
                    match self.eval_line(trimmed) {
                        Ok(Primitive::Null) => {}
                        Ok(value) => println!("{value}"),
                        Err(error) => eprintln!("{error}"),
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => return Err(readline_error(err)),
            }
        }
        Ok(())
    }
}

fn readline_error(err: ReadlineError) -> NoodleError {
    NoodleError::from(std::io::Error::other(err))
}
