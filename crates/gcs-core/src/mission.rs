use gcs_mission::{MissionItem, MissionType};

/// Download-side mission sync state (§3 "Mission state", §4.D.3 step 2, §4.D.6).
#[derive(Debug)]
pub struct MissionDownload {
    pub mission_type: MissionType,
    pub expected_count: u16,
    pub loaded: bool,
    pub received: Vec<MissionItem>,
}

impl Default for MissionDownload {
    fn default() -> Self {
        Self {
            mission_type: MissionType::Mission,
            expected_count: 0,
            loaded: false,
            received: Vec::new(),
        }
    }
}

/// What the download side wants sent next, if anything.
#[derive(Debug, PartialEq, Eq)]
pub enum DownloadAction {
    RequestSeq(u16),
    None,
}

impl MissionDownload {
    pub fn start(&mut self, mission_type: MissionType) {
        self.mission_type = mission_type;
        self.loaded = false;
        self.expected_count = 0;
        self.received.clear();
    }

    /// `MISSION_COUNT`/`WAYPOINT_COUNT` handler: clears the received list,
    /// records `expected_count`, and requests seq 0.
    pub fn on_count(&mut self, count: u16) -> DownloadAction {
        self.received.clear();
        self.expected_count = count;
        if count == 0 {
            self.loaded = true;
            DownloadAction::None
        } else {
            DownloadAction::RequestSeq(0)
        }
    }

    /// `MISSION_ITEM`/`WAYPOINT` handler. Discards out-of-order and duplicate
    /// items by comparing `seq` against `len(received)`; a strictly
    /// increasing prefix is the only thing ever appended.
    pub fn on_item(&mut self, item: MissionItem) -> DownloadAction {
        let n = self.received.len() as u16;
        if item.seq > n || item.seq < n {
            return DownloadAction::None;
        }
        self.received.push(item);
        let next = self.received.len() as u16;
        if next < self.expected_count {
            DownloadAction::RequestSeq(next)
        } else {
            self.loaded = true;
            DownloadAction::None
        }
    }
}

/// Upload-side mission sync state (§4.D.3 step 4, §4.D.5). `acked` is
/// present only while an upload is in progress, matching the spec's "an
/// optional per-index acked vector".
#[derive(Debug, Default)]
pub struct MissionUpload {
    pub waypoints: Vec<MissionItem>,
    pub acked: Option<Vec<bool>>,
}

impl MissionUpload {
    pub fn start(&mut self, waypoints: Vec<MissionItem>) {
        let acked = vec![false; waypoints.len()];
        self.waypoints = waypoints;
        self.acked = if self.waypoints.is_empty() {
            None
        } else {
            Some(acked)
        };
    }

    pub fn in_progress(&self) -> bool {
        self.acked.is_some()
    }

    pub fn is_complete(&self) -> bool {
        match &self.acked {
            Some(acked) => acked.iter().all(|done| *done),
            None => true,
        }
    }

    /// `MISSION_REQUEST`/`WAYPOINT_REQUEST` handler: looks up the waypoint at
    /// `seq` (target-id rewrite happens at the caller, which owns the link's
    /// current target) and marks it acked. Returns the item to send, if any.
    pub fn on_request(&mut self, seq: u16) -> Option<MissionItem> {
        let item = self.waypoints.get(seq as usize).cloned();
        if item.is_some() {
            if let Some(acked) = &mut self.acked {
                if let Some(slot) = acked.get_mut(seq as usize) {
                    *slot = true;
                }
            }
        }
        item
    }

    pub fn finish(&mut self) {
        self.acked = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(seq: u16) -> MissionItem {
        MissionItem {
            seq,
            command: 16,
            frame: gcs_mission::MissionFrame::GlobalRelativeAltInt,
            current: seq == 0,
            autocontinue: true,
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: 0,
            y: 0,
            z: 10.0,
        }
    }

    #[test]
    fn download_scenario_count_then_items_with_duplicate() {
        let mut dl = MissionDownload::default();
        dl.start(MissionType::Mission);

        assert_eq!(dl.on_count(2), DownloadAction::RequestSeq(0));
        assert_eq!(dl.on_item(item(0)), DownloadAction::RequestSeq(1));

        // duplicate seq=0 again: discarded, no new request, length unchanged.
        assert_eq!(dl.on_item(item(0)), DownloadAction::None);
        assert_eq!(dl.received.len(), 1);

        assert_eq!(dl.on_item(item(1)), DownloadAction::None);
        assert!(dl.loaded);
        assert_eq!(dl.received.len(), 2);
    }

    #[test]
    fn download_discards_out_of_order_future_item() {
        let mut dl = MissionDownload::default();
        dl.start(MissionType::Mission);
        dl.on_count(3);
        // seq=1 arrives before seq=0: out of order, discarded.
        assert_eq!(dl.on_item(item(1)), DownloadAction::None);
        assert!(dl.received.is_empty());
    }

    #[test]
    fn empty_mission_count_marks_loaded_immediately() {
        let mut dl = MissionDownload::default();
        dl.start(MissionType::Mission);
        assert_eq!(dl.on_count(0), DownloadAction::None);
        assert!(dl.loaded);
    }

    #[test]
    fn upload_scenario_serves_requests_in_any_order_and_completes() {
        let mut up = MissionUpload::default();
        up.start(vec![item(0), item(1)]);
        assert!(up.in_progress());
        assert!(!up.is_complete());

        let served = up.on_request(0).expect("item 0 exists");
        assert_eq!(served.seq, 0);
        assert!(!up.is_complete());

        let served = up.on_request(1).expect("item 1 exists");
        assert_eq!(served.seq, 1);
        assert!(up.is_complete());

        up.finish();
        assert!(!up.in_progress());
    }

    #[test]
    fn empty_upload_never_enters_progress() {
        let mut up = MissionUpload::default();
        up.start(Vec::new());
        assert!(!up.in_progress());
        assert!(up.is_complete());
    }
}
