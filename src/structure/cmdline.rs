use std::process::Command;

use anyhow::bail;

/// Builds the argument vector of a program invocation one argument at a time.
#[derive(Debug, Clone, Default)]
pub struct CmdLine {
    args: Vec<String>,
}

impl CmdLine {
    pub fn new() -> CmdLine {
        CmdLine::default()
    }

    /// Arguments are passed to `execve` as C strings, so they cannot contain NUL bytes.
    pub fn append(&mut self, arg: impl Into<String>) -> anyhow::Result<()> {
        let arg = arg.into();
        if arg.contains('\0') {
            bail!("command line argument {:?} contains a NUL byte", arg);
        }
        self.args.push(arg);
        Ok(())
    }

    pub fn append_multi<I, S>(&mut self, args: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.append(arg)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The complete argument vector, starting with the program
    pub fn finish(self) -> anyhow::Result<Vec<String>> {
        if self.args.is_empty() {
            bail!("command line has no program");
        }
        Ok(self.args)
    }

    pub fn into_command(self) -> anyhow::Result<Command> {
        let mut args = self.finish()?.into_iter();
        let mut command = match args.next() {
            Some(program) => Command::new(program),
            None => bail!("command line has no program"),
        };
        command.args(args);
        Ok(command)
    }
}
