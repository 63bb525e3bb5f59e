use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{CommandExecutor, CommandOutput, CommandRequest};

type Hook = Arc<dyn Fn(&CommandRequest) -> CommandOutput + Send + Sync>;

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    Hook(Hook),
}

struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
}

/// Executor that answers from a script instead of spawning processes.
///
/// Replies are matched by substring against the command line, first rule
/// wins. A rule with several replies hands them out in order and repeats
/// the last one. Commands without a rule succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.push(pattern, Reply::Output(output))
    }

    pub fn on_with<F>(&self, pattern: &str, hook: F) -> &Self
    where
        F: Fn(&CommandRequest) -> CommandOutput + Send + Sync + 'static,
    {
        self.push(pattern, Reply::Hook(Arc::new(hook)))
    }

    /// Drop every reply registered for `pattern`.
    pub fn clear(&self, pattern: &str) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.retain(|r| r.pattern != pattern);
    }

    pub fn calls(&self) -> Vec<String> {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.iter().map(|c| c.command_line.clone()).collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls
            .iter()
            .filter(|c| c.command_line.contains(pattern))
            .count()
    }

    fn push(&self, pattern: &str, reply: Reply) -> &Self {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        drop(rules);
        self
    }

    fn next_reply(&self, command_line: &str) -> Option<Reply> {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let rule = rules
            .iter_mut()
            .find(|r| command_line.contains(&r.pattern))?;

        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, request: CommandRequest) -> CommandOutput {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        match self.next_reply(&request.command_line) {
            Some(Reply::Output(output)) => output,
            Some(Reply::Hook(hook)) => hook(&request),
            None => CommandOutput::ok(""),
        }
    }
}
