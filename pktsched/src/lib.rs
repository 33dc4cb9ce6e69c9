#![doc(issue_tracker_base_url = "https://github.com/chainbound/pktsched/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use pktsched_common::*;
pub use pktsched_ip::*;
pub use pktsched_nat::*;
pub use pktsched_police::*;
pub use pktsched_qdisc::*;
