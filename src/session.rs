use crate::error::{Error, Result};
use crate::llm::load_llm::{self, Capabilities, DeviceKind, ModelSource};
use crate::llm::{Generator, Loader, TextTokenizer};
use serde::Deserialize;
use std::io::{BufRead, Write};

pub const SUGGESTED_MODELS: [&str; 5] = [
    "HuggingFaceTB/SmolLM2-135M",
    "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
    "Qwen/Qwen2-0.5B",
    "microsoft/phi-2",
    "mistralai/Mistral-7B-v0.1",
];

const MODEL_PROMPT: &str =
    "Choose a model (a hub id like HuggingFaceTB/SmolLM2-135M, or a local directory): ";
const SINGLE_PROMPT: &str = "Give an input for the model: ";
const LOOP_PROMPT: &str = "Give an input for the model (x or q to quit): ";
const BUDGET_PROMPT: &str = "Max new tokens: ";

/// How prompts are read and how the token budget is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One prompt, fixed budget, then exit.
    Single,
    /// Prompt and budget per turn until `x` or `q`.
    Interactive,
}

impl Mode {
    pub fn device_priority(self) -> &'static [DeviceKind] {
        match self {
            Mode::Single => &[DeviceKind::Cuda, DeviceKind::Cpu],
            Mode::Interactive => &[DeviceKind::Cuda, DeviceKind::Metal, DeviceKind::Cpu],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Prompt(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = strip_newline(line);
        if line.eq_ignore_ascii_case("x") || line.eq_ignore_ascii_case("q") {
            Command::Exit
        } else {
            Command::Prompt(line.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingPrompt,
    Terminated,
}

pub fn parse_budget(raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| Error::InvalidBudget(strip_newline(raw).to_string()))
}

/// One prompt in, one decoded continuation out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub prompt: String,
    pub max_new_tokens: usize,
}

impl Turn {
    pub fn run<T, G>(&self, tokenizer: &T, generator: &mut G) -> Result<String>
    where
        T: TextTokenizer,
        G: Generator,
    {
        let input = tokenizer.encode(&self.prompt)?;
        let output = generator.generate(&input, self.max_new_tokens)?;
        tokenizer.decode(&output)
    }
}

/// Device, tokenizer and model, resolved once and reused by every turn.
pub struct Session<T, G> {
    pub mode: Mode,
    pub device_kind: DeviceKind,
    pub model: ModelSource,
    pub tokenizer: T,
    pub generator: G,
    /// Budget used when the mode does not ask for one.
    pub max_new_tokens: usize,
}

impl<T: TextTokenizer, G: Generator> Session<T, G> {
    /// Reads the model identifier, resolves the device and loads the model.
    pub fn start<L, R, W>(
        mode: Mode,
        cpu: bool,
        caps: Capabilities,
        max_new_tokens: usize,
        loader: &mut L,
        input: &mut R,
        output: &mut W,
    ) -> Result<Self>
    where
        L: Loader<Tokenizer = T, Generator = G>,
        R: BufRead,
        W: Write,
    {
        let (device_kind, device) = load_llm::device(cpu, mode.device_priority(), caps)?;
        tracing::info!(?device_kind, ?mode, "device resolved");

        if mode == Mode::Interactive {
            writeln!(output, "Suggested models:")?;
            for (i, name) in SUGGESTED_MODELS.iter().enumerate() {
                writeln!(output, "  {}. {name}", i + 1)?;
            }
        }
        let raw = read_line(MODEL_PROMPT, input, output)?
            .ok_or(Error::InputClosed("a model identifier"))?;
        let model = ModelSource::parse(&raw)?;

        let (tokenizer, generator) = loader.load(&model, &device)?;
        tracing::info!(model = %model.name(), "model loaded");

        Ok(Self {
            mode,
            device_kind,
            model,
            tokenizer,
            generator,
            max_new_tokens,
        })
    }

    /// Runs turns until the mode terminates. Returns the number of completed turns.
    pub fn run<R: BufRead, W: Write>(&mut self, input: &mut R, output: &mut W) -> Result<usize> {
        let mut state = LoopState::AwaitingPrompt;
        let mut turns = 0;
        while state == LoopState::AwaitingPrompt {
            state = match self.mode {
                Mode::Single => {
                    let prompt = read_line(SINGLE_PROMPT, input, output)?
                        .ok_or(Error::InputClosed("a prompt"))?;
                    let turn = Turn {
                        prompt: strip_newline(&prompt).to_string(),
                        max_new_tokens: self.max_new_tokens,
                    };
                    self.respond(&turn, output)?;
                    turns += 1;
                    LoopState::Terminated
                }
                Mode::Interactive => match read_line(LOOP_PROMPT, input, output)? {
                    None => LoopState::Terminated,
                    Some(line) => match Command::parse(&line) {
                        Command::Exit => LoopState::Terminated,
                        Command::Prompt(prompt) => {
                            let raw = read_line(BUDGET_PROMPT, input, output)?
                                .ok_or(Error::InputClosed("a token budget"))?;
                            let turn = Turn {
                                prompt,
                                max_new_tokens: parse_budget(&raw)?,
                            };
                            self.respond(&turn, output)?;
                            turns += 1;
                            LoopState::AwaitingPrompt
                        }
                    },
                },
            };
        }
        tracing::debug!(
            turns,
            device = ?self.device_kind,
            model = %self.model.name(),
            "session terminated"
        );
        Ok(turns)
    }

    fn respond<W: Write>(&mut self, turn: &Turn, output: &mut W) -> Result<()> {
        tracing::debug!(max_new_tokens = turn.max_new_tokens, "generating");
        let text = turn.run(&self.tokenizer, &mut self.generator)?;
        writeln!(output, "{text}")?;
        output.flush()?;
        Ok(())
    }
}

/// Prints `prompt` and reads one line, `None` at end of input.
fn read_line<R, W>(prompt: &str, input: &mut R, output: &mut W) -> Result<Option<String>>
where
    R: BufRead,
    W: Write,
{
    write!(output, "{prompt}")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn strip_newline(line: &str) -> &str {
    line.trim_end_matches(&['\n', '\r'][..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::cell::Cell;
    use std::io::Cursor;
    use std::rc::Rc;

    /// One token per byte.
    struct ByteTokenizer;

    impl TextTokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            String::from_utf8(bytes).map_err(Error::tokenizer)
        }
    }

    /// Appends `suffix` once and records every call.
    struct StubGenerator {
        suffix: &'static str,
        calls: Rc<Cell<usize>>,
        budgets: Vec<usize>,
    }

    impl Generator for StubGenerator {
        fn generate(&mut self, input: &[u32], max_new_tokens: usize) -> Result<Vec<u32>> {
            self.calls.set(self.calls.get() + 1);
            self.budgets.push(max_new_tokens);
            let mut out = input.to_vec();
            out.extend(self.suffix.bytes().map(u32::from).take(max_new_tokens));
            Ok(out)
        }
    }

    struct StubLoader {
        loads: usize,
        calls: Rc<Cell<usize>>,
        suffix: &'static str,
        seen: Vec<ModelSource>,
    }

    impl StubLoader {
        fn new(suffix: &'static str) -> Self {
            Self {
                loads: 0,
                calls: Rc::new(Cell::new(0)),
                suffix,
                seen: Vec::new(),
            }
        }
    }

    impl Loader for StubLoader {
        type Tokenizer = ByteTokenizer;
        type Generator = StubGenerator;

        fn load(
            &mut self,
            source: &ModelSource,
            device: &Device,
        ) -> Result<(ByteTokenizer, StubGenerator)> {
            assert!(device.is_cpu());
            self.loads += 1;
            self.seen.push(source.clone());
            Ok((
                ByteTokenizer,
                StubGenerator {
                    suffix: self.suffix,
                    calls: self.calls.clone(),
                    budgets: Vec::new(),
                },
            ))
        }
    }

    fn run_session(mode: Mode, stdin: &str, loader: &mut StubLoader) -> (Result<usize>, String) {
        let mut input = Cursor::new(stdin.as_bytes().to_vec());
        let mut output = Vec::new();
        let result = Session::start(
            mode,
            false,
            Capabilities::default(),
            50,
            loader,
            &mut input,
            &mut output,
        )
        .and_then(|mut session| {
            let turns = session.run(&mut input, &mut output)?;
            assert_eq!(session.device_kind, DeviceKind::Cpu);
            Ok((turns, session.generator.budgets))
        });
        let output = String::from_utf8(output).unwrap();
        match result {
            Ok((turns, budgets)) => {
                if mode == Mode::Single {
                    assert_eq!(budgets, vec![50; turns]);
                }
                (Ok(turns), output)
            }
            Err(e) => (Err(e), output),
        }
    }

    #[test]
    fn exit_sentinels_are_case_insensitive() {
        for line in ["x\n", "X\n", "q\n", "Q\r\n", "q"] {
            assert_eq!(Command::parse(line), Command::Exit, "{line:?}");
        }
        for line in ["xq\n", "quit\n", "x y\n", "\n"] {
            assert!(matches!(Command::parse(line), Command::Prompt(_)), "{line:?}");
        }
    }

    #[test]
    fn padded_sentinel_is_a_prompt() {
        assert_eq!(Command::parse(" q\n"), Command::Prompt(" q".to_string()));
        assert_eq!(Command::parse("  X  \r\n"), Command::Prompt("  X  ".to_string()));

        let mut loader = StubLoader::new(" foo");
        let (turns, output) = run_session(Mode::Interactive, "gpt2\n q\n4\nq\n", &mut loader);
        assert_eq!(turns.unwrap(), 1);
        assert_eq!(loader.calls.get(), 1);
        assert!(output.contains(" q foo\n"));
    }

    #[test]
    fn budget_must_be_a_non_negative_integer() {
        assert_eq!(parse_budget("10\n").unwrap(), 10);
        assert_eq!(parse_budget(" 0 ").unwrap(), 0);
        for raw in ["abc", "-1", "1.5", ""] {
            assert!(matches!(parse_budget(raw), Err(Error::InvalidBudget(_))), "{raw:?}");
        }
    }

    #[test]
    fn turn_appends_generated_text() {
        let mut generator = StubGenerator {
            suffix: " foo",
            calls: Rc::new(Cell::new(0)),
            budgets: Vec::new(),
        };
        let turn = Turn {
            prompt: "Hello world".to_string(),
            max_new_tokens: 10,
        };
        assert_eq!(turn.run(&ByteTokenizer, &mut generator).unwrap(), "Hello world foo");
        assert_eq!(generator.budgets, vec![10]);
    }

    #[test]
    fn echo_round_trip_reproduces_prompt() {
        let mut echo = StubGenerator {
            suffix: "",
            calls: Rc::new(Cell::new(0)),
            budgets: Vec::new(),
        };
        let turn = Turn {
            prompt: "The quick brown fox".to_string(),
            max_new_tokens: 5,
        };
        assert_eq!(turn.run(&ByteTokenizer, &mut echo).unwrap(), turn.prompt);
    }

    #[test]
    fn interactive_session_loops_until_sentinel() {
        let mut loader = StubLoader::new(" foo");
        let (turns, output) = run_session(
            Mode::Interactive,
            "gpt2\nHello world\n10\nsecond\n3\nQ\nnever read\n",
            &mut loader,
        );
        assert_eq!(turns.unwrap(), 2);
        assert_eq!(loader.loads, 1);
        assert_eq!(loader.calls.get(), 2);
        assert_eq!(loader.seen, vec![ModelSource::Hub("gpt2".to_string())]);
        assert!(output.contains("Suggested models:"));
        assert!(output.contains("Hello world foo\n"));
        assert!(output.contains("second fo\n"));
    }

    #[test]
    fn interactive_session_ends_at_end_of_input() {
        let mut loader = StubLoader::new(" foo");
        let (turns, _) = run_session(Mode::Interactive, "gpt2\nhi\n1\n", &mut loader);
        assert_eq!(turns.unwrap(), 1);
    }

    #[test]
    fn malformed_budget_aborts_before_generation() {
        let mut loader = StubLoader::new(" foo");
        let (turns, output) = run_session(Mode::Interactive, "gpt2\nHello\nabc\n", &mut loader);
        assert!(matches!(turns, Err(Error::InvalidBudget(raw)) if raw == "abc"));
        assert_eq!(loader.calls.get(), 0);
        assert!(!output.contains("Hello"));
    }

    #[test]
    fn single_session_runs_exactly_one_turn() {
        let mut loader = StubLoader::new(" foo");
        let (turns, output) = run_session(Mode::Single, "gpt2\nq\nmore\n", &mut loader);
        assert_eq!(turns.unwrap(), 1);
        assert_eq!(loader.loads, 1);
        assert_eq!(loader.calls.get(), 1);
        assert!(!output.contains("Suggested models:"));
        assert!(output.ends_with("q foo\n"));
    }

    #[test]
    fn single_session_requires_a_prompt() {
        let mut loader = StubLoader::new(" foo");
        let (turns, _) = run_session(Mode::Single, "gpt2\n", &mut loader);
        assert!(matches!(turns, Err(Error::InputClosed(_))));
        assert_eq!(loader.calls.get(), 0);
    }

    #[test]
    fn invalid_model_id_fails_before_loading() {
        let mut loader = StubLoader::new(" foo");
        let (turns, _) = run_session(Mode::Interactive, "not a model\n", &mut loader);
        assert!(matches!(turns, Err(Error::InvalidModelId(_))));
        assert_eq!(loader.loads, 0);
    }

    #[test]
    fn device_priority_depends_on_mode() {
        assert!(!Mode::Single.device_priority().contains(&DeviceKind::Metal));
        assert_eq!(Mode::Interactive.device_priority().len(), 3);
        assert_eq!(Mode::Single.device_priority().last(), Some(&DeviceKind::Cpu));
    }
}
