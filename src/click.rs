//! Pointer control and click verification.
//! Each accepted region is clicked through an escalating ladder of
//! strategies, with the affordance re-checked between tiers. The pointer
//! returns to its pre-batch position on every exit path out of a batch,
//! followed by one click there to hand focus back to the original window.

use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::detect::Region;
use crate::filter::Capture;
use crate::helper;

/// Virtual pointer primitives. Failures here are fatal to the click batch.
pub trait Pointer {
    fn position(&mut self) -> Result<(i32, i32)>;
    fn move_to(&mut self, x: i32, y: i32) -> Result<()>;
    fn click(&mut self) -> Result<()>;
    /// Confirmation key press, the last-resort acknowledgement.
    fn confirm_key(&mut self) -> Result<()>;
}

pub struct EnigoPointer {
    enigo: Enigo,
}

impl EnigoPointer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            enigo: Enigo::new(&Settings::default())
                .context("failed to initialize input backend")?,
        })
    }
}

impl Pointer for EnigoPointer {
    fn position(&mut self) -> Result<(i32, i32)> {
        self.enigo.location().context("failed to read pointer position")
    }

    fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
        self.enigo
            .move_mouse(x, y, Coordinate::Abs)
            .context("failed to move pointer")
    }

    fn click(&mut self) -> Result<()> {
        self.enigo
            .button(Button::Left, Direction::Click)
            .context("failed to click")
    }

    fn confirm_key(&mut self) -> Result<()> {
        self.enigo
            .key(Key::Return, Direction::Click)
            .context("failed to press confirmation key")
    }
}

/// External click mechanism. `Ok(false)` means the helper could not be
/// located; `Err` means it was found but the invocation failed. Either way
/// the click is demoted to the pointer, never aborted.
pub trait ClickHelper {
    fn click(&self, x: i32, y: i32, delay: Duration) -> Result<bool>;
}

/// Re-probes the helper installation on every click; the binary can appear
/// or vanish between iterations.
pub struct ExternalClickHelper;

impl ClickHelper for ExternalClickHelper {
    fn click(&self, x: i32, y: i32, delay: Duration) -> Result<bool> {
        match helper::find_click_helper() {
            Some(path) => helper::click_at(&path, x, y, delay).map(|_| true),
            None => Ok(false),
        }
    }
}

/// One rung of the click ladder, tried in order until the affordance
/// disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClickTier {
    Helper,
    Pointer,
    ConfirmKey,
}

/// Result of the verify loop for a single capture.
#[derive(Debug, Clone, Copy)]
pub struct ClickOutcome {
    pub region: Region,
    pub attempts: u32,
    pub succeeded: bool,
}

pub struct ClickController<'a> {
    pointer: &'a mut dyn Pointer,
    helper: &'a dyn ClickHelper,
    prefer_helper: bool,
    click_delay: Duration,
    settle_delay: Duration,
    debug: bool,
}

impl<'a> ClickController<'a> {
    pub fn new(
        pointer: &'a mut dyn Pointer,
        helper: &'a dyn ClickHelper,
        prefer_helper: bool,
        click_delay: Duration,
        settle_delay: Duration,
        debug: bool,
    ) -> Self {
        Self { pointer, helper, prefer_helper, click_delay, settle_delay, debug }
    }

    /// Clicks every capture and verifies the affordance disappeared,
    /// escalating through the fallback tiers. `still_present` re-examines a
    /// region after a click and should report `true` when it cannot tell, so
    /// the next tier fires. An unresolved region is logged and counted, not
    /// fatal; a pointer primitive failure is fatal to the batch but the
    /// pointer is still restored before the error surfaces.
    pub fn click_and_verify(
        &mut self,
        captures: &[Capture],
        still_present: &mut dyn FnMut(&Region) -> bool,
    ) -> Result<Vec<ClickOutcome>> {
        if captures.is_empty() {
            return Ok(Vec::new());
        }

        let helper = self.helper;
        let prefer_helper = self.prefer_helper;
        let click_delay = self.click_delay;
        let settle_delay = self.settle_delay;
        let debug = self.debug;

        let origin = self.pointer.position()?;
        if debug {
            println!("  saved pointer position: ({}, {})", origin.0, origin.1);
        }
        let mut guard = PointerRestore {
            pointer: &mut *self.pointer,
            origin,
            settle_delay,
            debug,
        };

        let mut outcomes = Vec::with_capacity(captures.len());
        for capture in captures {
            let (center_x, center_y) = capture.region.center();
            if debug {
                println!("  clicking region [{}] at ({center_x}, {center_y})", capture.index);
            }
            guard.pointer.move_to(center_x, center_y)?;
            sleep(click_delay);

            let first_tier = if prefer_helper { ClickTier::Helper } else { ClickTier::Pointer };
            let mut attempts = 0;
            let mut succeeded = false;
            for tier in [first_tier, ClickTier::Pointer, ClickTier::ConfirmKey] {
                attempts += 1;
                match tier {
                    ClickTier::Helper => match helper.click(center_x, center_y, click_delay) {
                        Ok(true) => {}
                        Ok(false) => {
                            // Helper gone since the last probe.
                            guard.pointer.click()?;
                        }
                        Err(err) => {
                            eprintln!("click helper failed, falling back to pointer: {err:#}");
                            guard.pointer.click()?;
                        }
                    },
                    ClickTier::Pointer => guard.pointer.click()?,
                    ClickTier::ConfirmKey => guard.pointer.confirm_key()?,
                }
                sleep(settle_delay);
                if !still_present(&capture.region) {
                    succeeded = true;
                    break;
                }
            }

            if !succeeded {
                eprintln!(
                    "affordance at ({}, {}) still present after {attempts} attempt(s)",
                    capture.region.x, capture.region.y
                );
            }
            outcomes.push(ClickOutcome { region: capture.region, attempts, succeeded });
        }
        Ok(outcomes)
    }
}

/// Returns the pointer to where the user left it. Dropping runs on every
/// exit path out of the click batch, error or not, and finishes with one
/// click at the restored position.
struct PointerRestore<'p> {
    pointer: &'p mut dyn Pointer,
    origin: (i32, i32),
    settle_delay: Duration,
    debug: bool,
}

impl Drop for PointerRestore<'_> {
    fn drop(&mut self) {
        let (x, y) = self.origin;
        if self.debug {
            println!("  restoring pointer to ({x}, {y})");
        }
        if let Err(err) = self.pointer.move_to(x, y) {
            eprintln!("failed to restore pointer position: {err:#}");
            return;
        }
        sleep(self.settle_delay);
        if let Err(err) = self.pointer.click() {
            eprintln!("failed to click at restored position: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use image::RgbaImage;
    use std::cell::Cell;

    #[derive(Default)]
    struct RecordingPointer {
        start: (i32, i32),
        queries: u32,
        moves: Vec<(i32, i32)>,
        clicks: u32,
        keys: u32,
        fail_clicks: bool,
    }

    impl Pointer for RecordingPointer {
        fn position(&mut self) -> Result<(i32, i32)> {
            self.queries += 1;
            Ok(self.start)
        }

        fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
            self.moves.push((x, y));
            Ok(())
        }

        fn click(&mut self) -> Result<()> {
            if self.fail_clicks {
                bail!("simulated click failure");
            }
            self.clicks += 1;
            Ok(())
        }

        fn confirm_key(&mut self) -> Result<()> {
            self.keys += 1;
            Ok(())
        }
    }

    struct NoHelper;

    impl ClickHelper for NoHelper {
        fn click(&self, _x: i32, _y: i32, _delay: Duration) -> Result<bool> {
            Ok(false)
        }
    }

    struct CountingHelper(Cell<u32>);

    impl ClickHelper for CountingHelper {
        fn click(&self, _x: i32, _y: i32, _delay: Duration) -> Result<bool> {
            self.0.set(self.0.get() + 1);
            Ok(true)
        }
    }

    struct FailingHelper;

    impl ClickHelper for FailingHelper {
        fn click(&self, _x: i32, _y: i32, _delay: Duration) -> Result<bool> {
            bail!("simulated helper failure")
        }
    }

    fn capture_at(x: u32, y: u32, width: u32, height: u32, index: usize) -> Capture {
        Capture {
            region: Region { x, y, width, height },
            image: RgbaImage::new(width, height),
            index,
        }
    }

    fn controller<'a>(
        pointer: &'a mut RecordingPointer,
        helper: &'a dyn ClickHelper,
        prefer_helper: bool,
    ) -> ClickController<'a> {
        ClickController::new(
            pointer,
            helper,
            prefer_helper,
            Duration::ZERO,
            Duration::ZERO,
            false,
        )
    }

    #[test]
    fn empty_batch_never_touches_the_pointer() {
        let mut pointer = RecordingPointer::default();
        let helper = NoHelper;
        let outcomes = controller(&mut pointer, &helper, false)
            .click_and_verify(&[], &mut |_| false)
            .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(pointer.queries, 0);
        assert!(pointer.moves.is_empty());
        assert_eq!(pointer.clicks, 0);
        assert_eq!(pointer.keys, 0);
    }

    #[test]
    fn clicks_center_then_restores_and_hands_back_focus() {
        let mut pointer = RecordingPointer { start: (100, 100), ..Default::default() };
        let helper = NoHelper;
        let captures = [capture_at(200, 300, 100, 50, 0)];

        let outcomes = controller(&mut pointer, &helper, false)
            .click_and_verify(&captures, &mut |_| false)
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].attempts, 1);
        assert!(outcomes[0].succeeded);
        // Move to the center, then back to the saved position.
        assert_eq!(pointer.moves, vec![(250, 325), (100, 100)]);
        // One click on the target, one at the restored position.
        assert_eq!(pointer.clicks, 2);
        assert_eq!(pointer.keys, 0);
    }

    #[test]
    fn restores_the_pointer_even_when_the_click_primitive_fails() {
        let mut pointer = RecordingPointer {
            start: (100, 100),
            fail_clicks: true,
            ..Default::default()
        };
        let helper = NoHelper;
        let captures = [capture_at(200, 300, 100, 50, 0)];

        let result = controller(&mut pointer, &helper, false)
            .click_and_verify(&captures, &mut |_| false);

        assert!(result.is_err());
        // The restore move still ran before the error surfaced.
        assert_eq!(pointer.moves, vec![(250, 325), (100, 100)]);
    }

    #[test]
    fn ladder_escalates_through_all_tiers_on_a_stubborn_affordance() {
        let mut pointer = RecordingPointer { start: (0, 0), ..Default::default() };
        let helper = NoHelper;
        let captures = [capture_at(10, 10, 80, 30, 0)];

        let outcomes = controller(&mut pointer, &helper, false)
            .click_and_verify(&captures, &mut |_| true)
            .unwrap();

        assert_eq!(outcomes[0].attempts, 3);
        assert!(!outcomes[0].succeeded);
        // Two click tiers, the confirmation key, then the focus-return click.
        assert_eq!(pointer.clicks, 3);
        assert_eq!(pointer.keys, 1);
    }

    #[test]
    fn unresolved_region_does_not_abort_the_rest_of_the_batch() {
        let mut pointer = RecordingPointer::default();
        let helper = NoHelper;
        let captures = [capture_at(10, 10, 80, 30, 0), capture_at(10, 100, 80, 30, 1)];

        let outcomes = controller(&mut pointer, &helper, false)
            .click_and_verify(&captures, &mut |_| true)
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|outcome| !outcome.succeeded));
    }

    #[test]
    fn preferred_helper_is_used_for_the_first_tier() {
        let mut pointer = RecordingPointer::default();
        let helper = CountingHelper(Cell::new(0));
        let captures = [capture_at(10, 10, 80, 30, 0)];

        let outcomes = controller(&mut pointer, &helper, true)
            .click_and_verify(&captures, &mut |_| false)
            .unwrap();

        assert!(outcomes[0].succeeded);
        assert_eq!(helper.0.get(), 1);
        // Only the focus-return click used the pointer.
        assert_eq!(pointer.clicks, 1);
    }

    #[test]
    fn helper_failure_demotes_the_click_to_the_pointer() {
        let mut pointer = RecordingPointer::default();
        let helper = FailingHelper;
        let captures = [capture_at(10, 10, 80, 30, 0)];

        let outcomes = controller(&mut pointer, &helper, true)
            .click_and_verify(&captures, &mut |_| false)
            .unwrap();

        assert!(outcomes[0].succeeded);
        assert_eq!(outcomes[0].attempts, 1);
        // The demoted click plus the focus-return click.
        assert_eq!(pointer.clicks, 2);
    }

    #[test]
    fn second_tier_resolution_stops_before_the_confirmation_key() {
        let mut pointer = RecordingPointer::default();
        let helper = NoHelper;
        let captures = [capture_at(10, 10, 80, 30, 0)];
        let mut checks = 0;

        let outcomes = controller(&mut pointer, &helper, false)
            .click_and_verify(&captures, &mut |_| {
                checks += 1;
                checks < 2
            })
            .unwrap();

        assert_eq!(outcomes[0].attempts, 2);
        assert!(outcomes[0].succeeded);
        assert_eq!(pointer.keys, 0);
    }
}
