#![doc(issue_tracker_base_url = "https://github.com/chainbound/netslice/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use netslice_core::*;

pub use netslice_common as common;
pub use netslice_net as net;
pub use netslice_qos as qos;
pub use netslice_shell as shell;
