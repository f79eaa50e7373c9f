pub mod audio_sink;
pub mod config;
pub mod console;
pub mod round_loader;
pub mod tts;
