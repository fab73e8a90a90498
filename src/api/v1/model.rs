use serde::{Serialize, Deserialize};

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Acked {
    pub(crate) id: String,
    pub(crate) accepted: bool,
}
