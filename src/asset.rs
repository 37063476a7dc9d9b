use crate::TxScriptError;
use std::collections::HashMap;

/// Identifies an asset by its genesis transaction and group index.
/// Ordering is byte-wise over the txid, then over the group index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AssetId {
    pub txid: [u8; 32],
    pub group_index: u16,
}

impl AssetId {
    pub fn new(txid: [u8; 32], group_index: u16) -> Self {
        Self { txid, group_index }
    }
}

/// An input of an asset group. Local inputs reference an input of the
/// transaction under validation; intent inputs reference an output of a
/// different transaction, carried by txid.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AssetInput {
    Local { input_index: u32, amount: u64 },
    Intent { txid: [u8; 32], output_index: u32, amount: u64 },
}

impl AssetInput {
    pub fn amount(&self) -> u64 {
        match self {
            AssetInput::Local { amount, .. } | AssetInput::Intent { amount, .. } => *amount,
        }
    }

    pub fn is_intent(&self) -> bool {
        matches!(self, AssetInput::Intent { .. })
    }

    /// Discriminant pushed by the group enumeration opcode.
    pub(crate) fn type_code(&self) -> i64 {
        match self {
            AssetInput::Local { .. } => 1,
            AssetInput::Intent { .. } => 2,
        }
    }
}

/// An output of an asset group. Both variants are keyed by a transaction
/// output index; intent outputs additionally mark the amount as pending a
/// counterparty transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AssetOutput {
    Local { output_index: u32, amount: u64 },
    Intent { output_index: u32, amount: u64 },
}

impl AssetOutput {
    pub fn amount(&self) -> u64 {
        match self {
            AssetOutput::Local { amount, .. } | AssetOutput::Intent { amount, .. } => *amount,
        }
    }

    pub fn output_index(&self) -> u32 {
        match self {
            AssetOutput::Local { output_index, .. } | AssetOutput::Intent { output_index, .. } => *output_index,
        }
    }

    pub fn is_intent(&self) -> bool {
        matches!(self, AssetOutput::Intent { .. })
    }

    pub(crate) fn type_code(&self) -> i64 {
        match self {
            AssetOutput::Local { .. } => 1,
            AssetOutput::Intent { .. } => 2,
        }
    }
}

/// One issuance or transfer within a packet. The inner sequences keep the
/// producer's declared order and are never resized by the VM.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AssetGroup {
    pub id: AssetId,
    pub control: Option<AssetId>,
    /// Merkle root over the group's metadata entries; all-zero for an empty
    /// set. Producer-computed, the VM only exposes it.
    pub metadata_hash: [u8; 32],
    pub inputs: Vec<AssetInput>,
    pub outputs: Vec<AssetOutput>,
}

impl AssetGroup {
    pub(crate) fn input_sum(&self) -> Result<u64, TxScriptError> {
        self.inputs.iter().try_fold(0u64, |acc, input| acc.checked_add(input.amount()).ok_or(TxScriptError::AssetOverflow))
    }

    pub(crate) fn output_sum(&self) -> Result<u64, TxScriptError> {
        self.outputs.iter().try_fold(0u64, |acc, output| acc.checked_add(output.amount()).ok_or(TxScriptError::AssetOverflow))
    }

    pub(crate) fn intent_inputs(&self) -> impl Iterator<Item = &AssetInput> {
        self.inputs.iter().filter(|input| input.is_intent())
    }

    pub(crate) fn intent_outputs(&self) -> impl Iterator<Item = &AssetOutput> {
        self.outputs.iter().filter(|output| output.is_intent())
    }
}

/// A single (asset, amount) tally for one transaction input or output.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AssetEntry {
    pub id: AssetId,
    pub amount: u64,
}

/// The decoded asset packet accompanying a transaction. Owned by the caller
/// and treated as an immutable snapshot for the lifetime of the VM.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AssetPacket {
    pub groups: Vec<AssetGroup>,
    /// Per transaction-input tallies, keyed by input index. Only local group
    /// inputs contribute; intent inputs live in another transaction.
    pub input_assets: HashMap<u32, Vec<AssetEntry>>,
    /// Per transaction-output tallies, keyed by output index.
    pub output_assets: HashMap<u32, Vec<AssetEntry>>,
}

impl AssetPacket {
    /// Builds a packet from its groups, aggregating the per-input and
    /// per-output tallies. Aggregation keeps the group declaration order and
    /// merges repeated asset ids; a `u64` overflow while merging is an
    /// `AssetOverflow` error.
    pub fn from_groups(groups: Vec<AssetGroup>) -> Result<Self, TxScriptError> {
        let mut input_assets: HashMap<u32, Vec<AssetEntry>> = HashMap::new();
        let mut output_assets: HashMap<u32, Vec<AssetEntry>> = HashMap::new();

        for group in &groups {
            for input in &group.inputs {
                if let AssetInput::Local { input_index, amount } = input {
                    merge_entry(input_assets.entry(*input_index).or_default(), group.id, *amount)?;
                }
            }
            for output in &group.outputs {
                merge_entry(output_assets.entry(output.output_index()).or_default(), group.id, output.amount())?;
            }
        }

        Ok(Self { groups, input_assets, output_assets })
    }

    pub(crate) fn group(&self, k: i64) -> Result<&AssetGroup, TxScriptError> {
        usize::try_from(k)
            .ok()
            .and_then(|k| self.groups.get(k))
            .ok_or(TxScriptError::AssetIndexOutOfRange(k, self.groups.len()))
    }

    pub fn find_group(&self, id: &AssetId) -> Option<usize> {
        self.groups.iter().position(|group| group.id == *id)
    }

    pub(crate) fn input_entries(&self, input_index: i64) -> &[AssetEntry] {
        u32::try_from(input_index).ok().and_then(|i| self.input_assets.get(&i)).map(Vec::as_slice).unwrap_or_default()
    }

    pub(crate) fn output_entries(&self, output_index: i64) -> &[AssetEntry] {
        u32::try_from(output_index).ok().and_then(|o| self.output_assets.get(&o)).map(Vec::as_slice).unwrap_or_default()
    }
}

fn merge_entry(entries: &mut Vec<AssetEntry>, id: AssetId, amount: u64) -> Result<(), TxScriptError> {
    match entries.iter_mut().find(|entry| entry.id == id) {
        Some(entry) => {
            entry.amount = entry.amount.checked_add(amount).ok_or(TxScriptError::AssetOverflow)?;
        }
        None => entries.push(AssetEntry { id, amount }),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_group_packet() -> AssetPacket {
        let asset = AssetId::new([1u8; 32], 0);
        let control = AssetId::new([2u8; 32], 1);
        AssetPacket::from_groups(vec![
            AssetGroup {
                id: asset,
                control: Some(control),
                metadata_hash: [0xde; 32],
                inputs: vec![
                    AssetInput::Local { input_index: 0, amount: 1000 },
                    AssetInput::Intent { txid: [3u8; 32], output_index: 2, amount: 500 },
                ],
                outputs: vec![
                    AssetOutput::Local { output_index: 0, amount: 800 },
                    AssetOutput::Intent { output_index: 1, amount: 700 },
                ],
            },
            AssetGroup {
                id: control,
                control: None,
                metadata_hash: [0u8; 32],
                inputs: vec![AssetInput::Local { input_index: 1, amount: 200 }],
                outputs: vec![AssetOutput::Local { output_index: 2, amount: 200 }],
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_aggregates_follow_group_order() {
        let packet = two_group_packet();
        let asset = AssetId::new([1u8; 32], 0);
        let control = AssetId::new([2u8; 32], 1);

        // Intent inputs do not land in the per-input tallies.
        assert_eq!(packet.input_entries(0), &[AssetEntry { id: asset, amount: 1000 }]);
        assert_eq!(packet.input_entries(1), &[AssetEntry { id: control, amount: 200 }]);
        assert_eq!(packet.input_entries(2), &[]);

        // Intent outputs do.
        assert_eq!(packet.output_entries(0), &[AssetEntry { id: asset, amount: 800 }]);
        assert_eq!(packet.output_entries(1), &[AssetEntry { id: asset, amount: 700 }]);
        assert_eq!(packet.output_entries(2), &[AssetEntry { id: control, amount: 200 }]);
    }

    #[test]
    fn test_group_sums() {
        let packet = two_group_packet();
        assert_eq!(packet.groups[0].input_sum(), Ok(1500));
        assert_eq!(packet.groups[0].output_sum(), Ok(1500));
        assert_eq!(packet.groups[1].output_sum(), Ok(200));
    }

    #[test]
    fn test_sum_overflow() {
        let group = AssetGroup {
            outputs: vec![
                AssetOutput::Local { output_index: 0, amount: u64::MAX },
                AssetOutput::Local { output_index: 1, amount: 1 },
            ],
            ..Default::default()
        };
        assert_eq!(group.output_sum(), Err(TxScriptError::AssetOverflow));
    }

    #[test]
    fn test_aggregate_overflow_at_construction() {
        let id = AssetId::new([9u8; 32], 0);
        let groups = vec![
            AssetGroup { id, outputs: vec![AssetOutput::Local { output_index: 0, amount: u64::MAX }], ..Default::default() },
            AssetGroup { id, outputs: vec![AssetOutput::Local { output_index: 0, amount: 1 }], ..Default::default() },
        ];
        assert_eq!(AssetPacket::from_groups(groups), Err(TxScriptError::AssetOverflow));
    }

    #[test]
    fn test_group_index_bounds() {
        let packet = two_group_packet();
        assert!(packet.group(0).is_ok());
        assert!(packet.group(1).is_ok());
        assert_eq!(packet.group(2).unwrap_err(), TxScriptError::AssetIndexOutOfRange(2, 2));
        assert_eq!(packet.group(-1).unwrap_err(), TxScriptError::AssetIndexOutOfRange(-1, 2));
    }

    #[test]
    fn test_find_group() {
        let packet = two_group_packet();
        assert_eq!(packet.find_group(&AssetId::new([2u8; 32], 1)), Some(1));
        assert_eq!(packet.find_group(&AssetId::new([2u8; 32], 0)), None);
    }
}
