//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "[STOP]");

// Stage indicators
pub static STAGE: Emoji<'_, '_> = Emoji("🧭 ", "[S]");
pub static DIALOGUE: Emoji<'_, '_> = Emoji("💬 ", "[D]");
pub static CHART: Emoji<'_, '_> = Emoji("📊 ", "[C]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static BOOK: Emoji<'_, '_> = Emoji("📚 ", "[REF]");
pub static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
