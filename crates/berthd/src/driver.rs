//! Outbound decisions to the resource manager.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use berth_core::{TaskEvent, TaskRecordSink};
use berth_scheduler::{AcceptedOffer, DeclinedOffer};

/// Where accept/decline decisions go.
pub trait ResourceManagerDriver: Send + Sync {
    fn accept(&self, offer: &AcceptedOffer) -> anyhow::Result<()>;

    fn decline(&self, offer: &DeclinedOffer) -> anyhow::Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Accept(&'a AcceptedOffer),
    Decline(&'a DeclinedOffer),
    TaskEvent { event: &'a TaskEvent },
}

/// Writes each decision and task event as one JSON line.
pub struct JsonLinesDriver<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesDriver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, line: &Line<'_>) -> anyhow::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *out, line)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> ResourceManagerDriver for JsonLinesDriver<W> {
    fn accept(&self, offer: &AcceptedOffer) -> anyhow::Result<()> {
        self.write(&Line::Accept(offer))
    }

    fn decline(&self, offer: &DeclinedOffer) -> anyhow::Result<()> {
        self.write(&Line::Decline(offer))
    }
}

impl<W: Write + Send> TaskRecordSink for JsonLinesDriver<W> {
    fn record(&self, event: &TaskEvent) -> anyhow::Result<()> {
        self.write(&Line::TaskEvent { event })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::HumanDuration;
    use berth_scheduler::DeclineReason;

    #[test]
    fn writes_one_tagged_line_per_decision() {
        let driver = JsonLinesDriver::new(Vec::new());
        driver
            .decline(&DeclinedOffer {
                offer_id: "o1".to_string(),
                machine_id: "m1".to_string(),
                refuse_for: HumanDuration::from_secs(5),
                reason: DeclineReason::NoMatch,
            })
            .unwrap();
        driver
            .record(&TaskEvent::Lost {
                task_id: "t1".to_string(),
                machine_id: "m1".to_string(),
                reason: "gone".to_string(),
                timestamp: 7,
            })
            .unwrap();

        let text = String::from_utf8(driver.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "decline");
        assert_eq!(lines[0]["refuse_for"], "5s");
        assert_eq!(lines[1]["type"], "task_event");
        assert_eq!(lines[1]["event"]["type"], "lost");
    }
}
