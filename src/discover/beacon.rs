use std::collections::HashSet;

use super::presence::NearbyPresence;

/// 用本机扫描到的信标ID对GPS候选做二次确认。
///
/// 信标只是辅助信号：`observed` 为空（客户端没有扫描或不支持）时原样返回
/// GPS 候选，调用方退回到仅GPS匹配。`observed` 非空时只保留信标ID命中的候选，
/// 没有信标ID的候选一律丢弃。候选的顺序保持不变。
pub fn corroborate(candidates: Vec<NearbyPresence>, observed: &[String]) -> Vec<NearbyPresence> {
    if observed.is_empty() {
        return candidates;
    }

    let observed: HashSet<&str> = observed.iter().map(|id| id.trim()).collect();

    candidates
        .into_iter()
        .filter(|candidate| {
            candidate
                .presence
                .beacon_id
                .as_deref()
                .is_some_and(|beacon| observed.contains(beacon))
        })
        .collect()
}
