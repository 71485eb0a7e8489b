use anyhow::Result;
use dialoguer::Confirm;
use log::info;

/// Решение оператора перед разрушительной операцией или при ошибке проверки
pub trait Confirmation: Send + Sync {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Спрашивает оператора в терминале
pub struct TerminalConfirm;

impl Confirmation for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
    }
}

/// Всегда отвечает одинаково (режим `--yes` и тесты)
pub struct FixedAnswer(pub bool);

impl Confirmation for FixedAnswer {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        info!("{} -> {}", prompt, if self.0 { "да" } else { "нет" });
        Ok(self.0)
    }
}
