/// Outgoing "chat action" (typing indicator, etc).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
    UploadPhoto,
    RecordVoice,
    UploadVoice,
}

/// Picture to send: a public URL or raw bytes (e.g. a generated chart).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhotoSource {
    Url(String),
    Bytes(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ButtonAction {
    Callback(String),
    Url(String),
    /// Prefills an inline query in a chat picked by the user.
    SwitchInline(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub action: ButtonAction,
    pub hidden: bool,
}

impl InlineButton {
    pub fn text(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Callback(data.into()),
            hidden: false,
        }
    }

    pub fn url(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Url(url.into()),
            hidden: false,
        }
    }

    pub fn switch_inline(label: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::SwitchInline(query.into()),
            hidden: false,
        }
    }

    /// Mark the button hidden when `hide` is true; hidden buttons never render.
    pub fn hide_if(mut self, hide: bool) -> Self {
        self.hidden = self.hidden || hide;
        self
    }
}

/// Inline keyboard builder.
///
/// Single-button helpers add a full-width row. Hidden buttons are dropped and
/// rows left empty are skipped, so menus can be declared once with per-user
/// visibility flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(self, label: impl Into<String>, data: impl Into<String>, hide: bool) -> Self {
        self.button(InlineButton::text(label, data).hide_if(hide))
    }

    pub fn url(self, label: impl Into<String>, url: impl Into<String>, hide: bool) -> Self {
        self.button(InlineButton::url(label, url).hide_if(hide))
    }

    pub fn switch_inline(
        self,
        label: impl Into<String>,
        query: impl Into<String>,
        hide: bool,
    ) -> Self {
        self.button(InlineButton::switch_inline(label, query).hide_if(hide))
    }

    pub fn button(self, button: InlineButton) -> Self {
        self.row(vec![button])
    }

    pub fn row(mut self, buttons: Vec<InlineButton>) -> Self {
        let row: Vec<InlineButton> = buttons.into_iter().filter(|b| !b.hidden).collect();
        if !row.is_empty() {
            self.rows.push(row);
        }
        self
    }

    pub fn rows(self, rows: impl IntoIterator<Item = Vec<InlineButton>>) -> Self {
        rows.into_iter().fold(self, |kb, row| kb.row(row))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
