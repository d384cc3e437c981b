// Smartmark services
// Services provide ambient functionality: configuration and logging.

pub mod logging;
pub mod settings_engine;
