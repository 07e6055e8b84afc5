mod renderfns;

use crate::app::App;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use renderfns::header::HeaderInfo;
use renderfns::{draw_footer, draw_header, payload_lines};

/// Main draw function
pub fn draw(frame: &mut Frame, app: &App) {
  let state = app.state();
  let error_height = if state.error.is_some() { 1 } else { 0 };

  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(1),            // Header
      Constraint::Min(1),               // Main content
      Constraint::Length(error_height), // Error banner
      Constraint::Length(1),            // Shortcuts
    ])
    .split(frame.area());

  let updated = app.time_since_last_update();
  draw_header(
    frame,
    chunks[0],
    &HeaderInfo {
      title: app.title(),
      dataset_key: app.dataset_key(),
      period: &state.preferences.period,
      live: app.is_live(),
      loading: state.loading,
      updated: &updated,
    },
  );

  draw_dataset(frame, chunks[1], app.title(), &state);

  if let Some(error) = &state.error {
    let banner = Paragraph::new(format!(" ⚠ {}", error))
      .style(Style::default().fg(Color::White).bg(Color::Red));
    frame.render_widget(banner, chunks[2]);
  }

  draw_footer(frame, chunks[3]);
}

/// Draw the last known dataset, even when the latest refresh failed
fn draw_dataset(frame: &mut Frame, area: Rect, title: &str, state: &crate::store::RefreshState) {
  let block = Block::default()
    .title(format!(" {} ", title))
    .title_alignment(Alignment::Center)
    .borders(Borders::ALL)
    .border_style(Style::default().fg(Color::Blue));

  let width = area.width.saturating_sub(4) as usize;

  let content: Vec<Line> = match &state.data {
    Some(dataset) => payload_lines(&dataset.payload, width)
      .into_iter()
      .map(Line::from)
      .collect(),
    None if state.loading => vec![Line::styled(
      "Loading...",
      Style::default().fg(Color::DarkGray),
    )],
    None if state.error.is_some() => vec![Line::styled(
      "Failed to load data. Press 'r' to retry.",
      Style::default().fg(Color::Red),
    )],
    None => vec![Line::styled(
      "No data yet. Press 'r' to refresh.",
      Style::default().fg(Color::DarkGray),
    )],
  };

  let paragraph = Paragraph::new(content)
    .block(block)
    .wrap(Wrap { trim: false });

  frame.render_widget(paragraph, area);
}
