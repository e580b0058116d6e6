pub mod telegram;

pub use telegram::{TelegramGetMeSkill, TelegramStatusSkill};
