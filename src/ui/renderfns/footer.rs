use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

const SHORTCUTS: [(&str, &str); 4] = [
  ("<r>", " refresh"),
  ("<p>", " pause/resume"),
  ("<t>", " period"),
  ("<q>", " quit"),
];

/// Draw the footer bar with keyboard shortcuts
pub fn draw_footer(frame: &mut Frame, area: Rect) {
  let mut spans = vec![Span::raw(" ")];

  for (i, (key, label)) in SHORTCUTS.iter().enumerate() {
    if i > 0 {
      spans.push(Span::raw("   "));
    }
    // Keys and brackets highlighted, descriptions dimmed
    spans.push(Span::styled(*key, Style::default().fg(Color::Cyan)));
    spans.push(Span::styled(*label, Style::default().fg(Color::DarkGray)));
  }

  let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Black));

  frame.render_widget(paragraph, area);
}
