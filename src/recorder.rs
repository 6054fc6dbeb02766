use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::types::{StepIndex, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Probe {
    Variable(usize),
    /// Fires of the threshold with this index.
    Events(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub group: usize,
    pub instance: usize,
    pub probe: Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordingHandle(usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// `group[instance].variable`, or `group[instance].event<k>` for threshold `k`.
    pub name: String,
    pub selection: Selection,
    pub registered_at: StepIndex,
    pub active: bool,
    pub series: Vec<(Time, f64)>,
}

impl Recording {
    pub fn times(&self) -> impl Iterator<Item = Time> + '_ {
        self.series.iter().map(|(time, _)| *time)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.series.iter().map(|(_, value)| *value)
    }
}

#[derive(Debug, Default)]
pub struct Recorder {
    recordings: Vec<Recording>,
}

impl Recorder {
    pub fn register(&mut self, name: String, selection: Selection, step: StepIndex) -> RecordingHandle {
        self.recordings.push(Recording {
            name,
            selection,
            registered_at: step,
            active: true,
            series: Vec::new(),
        });
        RecordingHandle(self.recordings.len() - 1)
    }

    pub fn get(&self, handle: RecordingHandle) -> Option<&Recording> {
        self.recordings.get(handle.0)
    }

    /// Returns `false` for an unknown handle.
    pub fn stop(&mut self, handle: RecordingHandle) -> bool {
        match self.recordings.get_mut(handle.0) {
            Some(recording) => {
                recording.active = false;
                true
            }
            None => false,
        }
    }

    pub fn has_active(&self) -> bool {
        self.recordings.iter().any(|recording| recording.active)
    }

    /// Empties every series and registers every recording anew at step 0.
    pub fn clear(&mut self) {
        for recording in &mut self.recordings {
            recording.series.clear();
            recording.registered_at = 0;
        }
    }

    /// Appends the post-step state of every active recording. Event recordings
    /// only grow on steps where their threshold fired.
    pub fn sample<F>(&mut self, step: StepIndex, time: Time, mut read: F) -> Result<(), DeviceError>
    where
        F: FnMut(&Selection) -> Result<f64, DeviceError>,
    {
        for recording in &mut self.recordings {
            if !recording.active || step < recording.registered_at {
                continue;
            }

            let value = read(&recording.selection)?;

            match recording.selection.probe {
                Probe::Variable(_) => recording.series.push((time, value)),
                Probe::Events(_) => {
                    if value != 0.0 {
                        recording.series.push((time, value));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::assert_equal;

    fn variable(instance: usize) -> Selection {
        Selection {
            group: 0,
            instance,
            probe: Probe::Variable(0),
        }
    }

    #[test]
    fn registration_step_is_respected() {
        let mut recorder = Recorder::default();
        let early = recorder.register("G[0].x".to_string(), variable(0), 0);
        let late = recorder.register("G[1].x".to_string(), variable(1), 2);

        for step in 1..=3 {
            recorder
                .sample(step, step as f64, |selection| Ok(selection.instance as f64 * 10.0))
                .unwrap();
        }

        assert_equal(recorder.get(early).unwrap().times(), [1.0, 2.0, 3.0]);
        assert_eq!(recorder.get(late).unwrap().name, "G[1].x");
        assert_equal(recorder.get(late).unwrap().series.iter().copied(), [(2.0, 10.0), (3.0, 10.0)]);
    }

    #[test]
    fn stopped_recording_keeps_series() {
        let mut recorder = Recorder::default();
        let handle = recorder.register("G[0].x".to_string(), variable(0), 0);
        recorder.sample(1, 0.5, |_| Ok(1.0)).unwrap();
        assert!(recorder.stop(handle));
        assert!(!recorder.has_active());
        recorder.sample(2, 1.0, |_| Ok(2.0)).unwrap();

        assert_equal(recorder.get(handle).unwrap().values(), [1.0]);
        assert!(!recorder.stop(RecordingHandle(7)));
    }

    #[test]
    fn events_only_on_fire() {
        let mut recorder = Recorder::default();
        let handle = recorder.register(
            "G[3].event0".to_string(),
            Selection {
                group: 0,
                instance: 3,
                probe: Probe::Events(0),
            },
            0,
        );

        for (step, fired) in [(1, 0.0), (2, 1.0), (3, 0.0), (4, 1.0)] {
            recorder.sample(step, step as f64, |_| Ok(fired)).unwrap();
        }

        assert_equal(recorder.get(handle).unwrap().times(), [2.0, 4.0]);

        recorder.clear();
        assert!(recorder.get(handle).unwrap().series.is_empty());
    }
}
