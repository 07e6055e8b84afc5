use crate::config::Config;
use crate::controller::RefreshController;
use crate::event::{Event, EventHandler};
use crate::store::{PreferencesUpdate, RefreshState};
use crate::ui;
use color_eyre::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use std::io::stdout;
use std::time::Duration;

/// Reporting periods offered by the period shortcut, in cycle order
pub const PERIODS: [&str; 3] = ["7d", "30d", "90d"];

/// What a key press asks the dashboard to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Quit,
  Refresh,
  ToggleAutoRefresh,
  CyclePeriod,
  None,
}

impl Command {
  pub fn from_key(key: KeyEvent) -> Self {
    match key.code {
      KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Command::Quit,
      KeyCode::Char('q') | KeyCode::Esc => Command::Quit,
      KeyCode::Char('r') | KeyCode::F(5) => Command::Refresh,
      KeyCode::Char('p') => Command::ToggleAutoRefresh,
      KeyCode::Char('t') => Command::CyclePeriod,
      _ => Command::None,
    }
  }
}

/// Period that follows `current` in [`PERIODS`]. Unknown periods restart the cycle.
pub fn next_period(current: &str) -> &'static str {
  match PERIODS.iter().position(|p| *p == current) {
    Some(i) => PERIODS[(i + 1) % PERIODS.len()],
    None => PERIODS[0],
  }
}

/// Main application state
pub struct App {
  config: Config,
  controller: RefreshController,
  should_quit: bool,
}

impl App {
  pub fn new(config: Config, controller: RefreshController) -> Self {
    Self {
      config,
      controller,
      should_quit: false,
    }
  }

  pub async fn run(&mut self) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    if self.controller.state().preferences.auto_refresh {
      self.controller.start(self.config.refresh.interval());
    } else {
      self.refresh();
    }

    let result = self.event_loop(&mut terminal).await;

    self.controller.stop();

    // Cleanup terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
  }

  async fn event_loop<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
    let mut events = EventHandler::new(Duration::from_millis(250));
    let mut state_rx = self.controller.subscribe();

    while !self.should_quit {
      terminal.draw(|frame| ui::draw(frame, self))?;

      tokio::select! {
        event = events.next() => match event {
          Some(Event::Key(key)) => self.handle_command(Command::from_key(key)),
          Some(Event::Tick) => {}
          None => break,
        },
        // Redraw as soon as a fetch starts or lands
        changed = state_rx.changed() => {
          if changed.is_err() {
            break;
          }
        }
      }
    }

    Ok(())
  }

  fn handle_command(&mut self, command: Command) {
    match command {
      Command::Quit => self.should_quit = true,
      Command::Refresh => self.refresh(),
      Command::ToggleAutoRefresh => self.toggle_auto_refresh(),
      Command::CyclePeriod => {
        let period = next_period(&self.controller.state().preferences.period);
        self.controller.update_preferences(PreferencesUpdate {
          period: Some(period.to_string()),
          auto_refresh: None,
        });
        self.refresh();
      }
      Command::None => {}
    }
  }

  /// Kick off an out-of-band fetch without blocking the draw loop
  fn refresh(&self) {
    let controller = self.controller.clone();
    tokio::spawn(async move {
      if !controller.refresh_now().await {
        tracing::debug!("refresh already in progress");
      }
    });
  }

  fn toggle_auto_refresh(&mut self) {
    let enabled = !self.controller.is_running();
    if enabled {
      self.controller.start(self.config.refresh.interval());
    } else {
      self.controller.stop();
    }
    self.controller.update_preferences(PreferencesUpdate {
      period: None,
      auto_refresh: Some(enabled),
    });
  }

  // Accessors for UI rendering
  pub fn title(&self) -> &str {
    self.config.display_title()
  }

  pub fn dataset_key(&self) -> &str {
    self.controller.dataset_key()
  }

  pub fn state(&self) -> RefreshState {
    self.controller.state()
  }

  pub fn is_live(&self) -> bool {
    self.controller.is_running()
  }

  pub fn time_since_last_update(&self) -> String {
    self.controller.time_since_last_update()
  }
}
