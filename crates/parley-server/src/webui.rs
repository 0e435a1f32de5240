use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;

use parley_core::UiConfig;

use crate::AppState;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const APP_JS: &str = include_str!("../assets/app.js");
const STYLE_CSS: &str = include_str!("../assets/style.css");

const FALLBACK_ACCENT: &str = "#4f8cff";

pub(crate) fn web_ui_router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/assets/app.js", get(app_js))
        .route("/assets/style.css", get(style_css))
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let ui = state.config.get().await.ui;
    Html(render_index(&ui))
}

async fn app_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        APP_JS,
    )
}

async fn style_css() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], STYLE_CSS)
}

fn render_index(ui: &UiConfig) -> String {
    let accent = if is_hex_color(&ui.accent) {
        ui.accent.as_str()
    } else {
        FALLBACK_ACCENT
    };
    INDEX_HTML
        .replace("{{THEME}}", ui.theme.as_str())
        .replace("{{ACCENT}}", accent)
        .replace("{{TITLE}}", &escape_html(ui.title.trim()))
}

/// `#rgb` or `#rrggbb`. Anything else could break out of the inline style.
fn is_hex_color(value: &str) -> bool {
    let Some(hex) = value.strip_prefix('#') else {
        return false;
    };
    matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::UiTheme;

    #[test]
    fn index_carries_theme_accent_and_title() {
        let ui = UiConfig {
            theme: UiTheme::Light,
            title: "Team Chat".to_string(),
            accent: "#10b981".to_string(),
        };
        let html = render_index(&ui);
        assert!(html.contains(r#"data-theme="light""#));
        assert!(html.contains("--accent: #10b981"));
        assert!(html.contains("<title>Team Chat</title>"));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn hostile_title_and_accent_are_neutralised() {
        let ui = UiConfig {
            theme: UiTheme::Dark,
            title: "<script>alert(1)</script>".to_string(),
            accent: "red;}</style><script>".to_string(),
        };
        let html = render_index(&ui);
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(html.contains("--accent: #4f8cff"));
        assert!(!html.contains("red;}"));
    }

    #[test]
    fn hex_colors() {
        assert!(is_hex_color("#fff"));
        assert!(is_hex_color("#4F8CFF"));
        assert!(!is_hex_color("4f8cff"));
        assert!(!is_hex_color("#4f8cf"));
        assert!(!is_hex_color("#ggg"));
    }
}
