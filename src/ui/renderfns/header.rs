use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// What the header shows besides the title
pub struct HeaderInfo<'a> {
  pub title: &'a str,
  pub dataset_key: &'a str,
  pub period: &'a str,
  pub live: bool,
  pub loading: bool,
  pub updated: &'a str,
}

/// Draw the header bar with title, dataset context and refresh status
pub fn draw_header(frame: &mut Frame, area: Rect, info: &HeaderInfo) {
  let separator = || Span::styled("│", Style::default().fg(Color::DarkGray));

  let (status, status_style) = if info.live {
    (" ● live ", Style::default().fg(Color::Green).bold())
  } else {
    (" ‖ paused ", Style::default().fg(Color::Yellow).bold())
  };

  let mut spans = vec![
    Span::styled(" pulseboard ", Style::default().fg(Color::Cyan).bold()),
    separator(),
    Span::styled(format!(" {} ", info.title), Style::default().fg(Color::White)),
    separator(),
    Span::styled(
      format!(" {} · {} ", info.dataset_key, info.period),
      Style::default().fg(Color::Yellow).bold(),
    ),
    separator(),
    Span::styled(status, status_style),
    separator(),
    Span::styled(
      format!(" updated {} ", updated_label(info.updated)),
      Style::default().fg(Color::DarkGray),
    ),
  ];

  if info.loading {
    spans.push(Span::styled(" refreshing…", Style::default().fg(Color::Cyan)));
  }

  let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Black));

  frame.render_widget(paragraph, area);
}

/// "Never" reads better lowercased after "updated"
fn updated_label(updated: &str) -> String {
  if updated == "Never" {
    "never".to_string()
  } else {
    updated.to_string()
  }
}
